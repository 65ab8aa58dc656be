/// Parses `adb devices` / `fastboot devices` output into the serials whose
/// state column equals `key` (`device` or `fastboot`).
pub fn parse_device_list(output: &[u8], key: &str) -> Vec<String> {
    String::from_utf8_lossy(output)
        .trim()
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.trim().split('\t').collect();
            if tokens.len() == 2 && tokens[1].trim() == key {
                Some(tokens[0].trim().to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Extracts the product name from `fastboot getvar product`, whose first
/// line reads `product: <name>`.
pub fn parse_fastboot_product(output: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(output);
    let first = text.trim().lines().next()?;
    let mut tokens = first.split(' ');
    tokens.next()?;
    tokens
        .next()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
}

/// Reads a single `getprop <key>` answer. Accepts the bracketed
/// `[key]: [value]` form as well.
pub fn parse_getprop_value(output: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    let value = match line.rsplit_once('[') {
        Some((_, tail)) => tail.trim_end_matches(']'),
        None => line,
    };
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

pub fn is_root_id_output(output: &[u8]) -> bool {
    let text = String::from_utf8_lossy(output);
    let trimmed = text.trim();
    trimmed == "0" || trimmed.contains("root")
}

pub fn is_boot_completed(output: &[u8]) -> bool {
    String::from_utf8_lossy(output).trim() == "1"
}
