pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

/// Resolves a configured tool path, falling back to `default_program` on PATH.
pub fn resolve_program(config_command_path: &str, default_program: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if normalized.is_empty() {
        default_program.to_string()
    } else {
        normalized
    }
}

pub fn resolve_adb_program(config_command_path: &str) -> String {
    resolve_program(config_command_path, "adb")
}

pub fn resolve_fastboot_program(config_command_path: &str) -> String {
    resolve_program(config_command_path, "fastboot")
}
