/// CDP description of a named key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDefinition<'a> {
    pub key: &'a str,
    pub code: &'a str,
    /// Text the key inserts, empty for non-printing keys.
    pub text: &'a str,
    /// Windows virtual key code; CDP uses it on every platform.
    pub virtual_key: i64,
}

/// Look up a key by its DOM name or a common alias (`esc`, `up`, `space`).
/// Unknown single characters type themselves.
pub fn key_definition(key: &str) -> KeyDefinition<'_> {
    let (key_value, code, text, vk) = match key.to_lowercase().as_str() {
        "enter" | "return" => ("Enter", "Enter", "\r", 13),
        "tab" => ("Tab", "Tab", "\t", 9),
        "escape" | "esc" => ("Escape", "Escape", "", 27),
        "backspace" => ("Backspace", "Backspace", "", 8),
        "delete" => ("Delete", "Delete", "", 46),
        "arrowup" | "up" => ("ArrowUp", "ArrowUp", "", 38),
        "arrowdown" | "down" => ("ArrowDown", "ArrowDown", "", 40),
        "arrowleft" | "left" => ("ArrowLeft", "ArrowLeft", "", 37),
        "arrowright" | "right" => ("ArrowRight", "ArrowRight", "", 39),
        "home" => ("Home", "Home", "", 36),
        "end" => ("End", "End", "", 35),
        "pageup" => ("PageUp", "PageUp", "", 33),
        "pagedown" => ("PageDown", "PageDown", "", 34),
        "space" => (" ", "Space", " ", 32),
        "insert" => ("Insert", "Insert", "", 45),
        "shift" => ("Shift", "ShiftLeft", "", 16),
        "control" | "ctrl" => ("Control", "ControlLeft", "", 17),
        "alt" => ("Alt", "AltLeft", "", 18),
        "meta" | "cmd" => ("Meta", "MetaLeft", "", 91),
        f if f.len() <= 3 && f.starts_with('f') && f[1..].parse::<u8>().is_ok_and(|n| (1..=12).contains(&n)) => {
            let n: i64 = f[1..].parse().unwrap_or(1);
            return KeyDefinition {
                key: FUNCTION_KEYS[(n - 1) as usize],
                code: FUNCTION_KEYS[(n - 1) as usize],
                text: "",
                virtual_key: 111 + n,
            };
        }
        _ => {
            let vk = single_char_vk(key);
            return KeyDefinition {
                key,
                code: key,
                text: if key.chars().count() == 1 { key } else { "" },
                virtual_key: vk,
            };
        }
    };

    KeyDefinition {
        key: key_value,
        code,
        text,
        virtual_key: vk,
    }
}

const FUNCTION_KEYS: [&str; 12] = [
    "F1", "F2", "F3", "F4", "F5", "F6", "F7", "F8", "F9", "F10", "F11", "F12",
];

fn single_char_vk(key: &str) -> i64 {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphanumeric() => c.to_ascii_uppercase() as i64,
        _ => 0,
    }
}
