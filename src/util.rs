//! Shared utility functions used across the codebase.

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`. Unset maps to `default`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Truncate `s` to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Pull the first top-level JSON object out of free-form model output.
///
/// Handles fenced code blocks and leading/trailing prose. Returns `None`
/// when no balanced `{...}` span parses as an object.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let trimmed = text.trim();
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(trimmed) {
        return Some(map);
    }

    let bytes = trimmed.as_bytes();
    let mut start = trimmed.find('{')?;
    loop {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &b) in bytes[start..].iter().enumerate() {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        let candidate = &trimmed[start..=start + offset];
                        if let Ok(serde_json::Value::Object(map)) =
                            serde_json::from_str(candidate)
                        {
                            return Some(map);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        start += 1 + trimmed[start + 1..].find('{')?;
    }
}

/// Replace `<key>` placeholders in `template` with values from `vars`.
///
/// String values are inserted verbatim, other values as compact JSON.
/// Unknown placeholders are left untouched.
pub fn fill_placeholders(
    template: &str,
    vars: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        let needle = format!("<{}>", key);
        if !out.contains(&needle) {
            continue;
        }
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&needle, &rendered);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // 'é' is two bytes; cutting in the middle backs off
        assert_eq!(truncate("é", 1), "");
    }

    #[test]
    fn extract_json_object_from_fenced_block() {
        let text = "Sure!\n```json\n{\"action\": \"dish_price\", \"arguments\": {\"x\": \"{}\"}}\n```";
        let map = extract_json_object(text).unwrap();
        assert_eq!(map["action"], json!("dish_price"));
        assert_eq!(map["arguments"]["x"], json!("{}"));
    }

    #[test]
    fn extract_json_object_skips_invalid_spans() {
        let text = "{not json} then {\"ok\": true}";
        let map = extract_json_object(text).unwrap();
        assert_eq!(map["ok"], json!(true));
    }

    #[test]
    fn extract_json_object_none_without_object() {
        assert!(extract_json_object("no braces here").is_none());
        assert!(extract_json_object("[1, 2, 3]").is_none());
    }

    #[test]
    fn fill_placeholders_substitutes_known_keys() {
        let vars = json!({"menu": "pasta", "count": 3});
        let vars = vars.as_object().unwrap();
        assert_eq!(
            fill_placeholders("Menu: <menu> (<count>) <missing>", vars),
            "Menu: pasta (3) <missing>"
        );
    }
}
