use crate::error::VirtupError;

/// Parse a human-readable disk size such as `"20G"` or `"512M"`.
///
/// Returns the size normalized for the image builder (`<n><unit>`), after
/// checking it is a positive number with a known binary unit.
pub fn parse_size(s: &str) -> Result<String, VirtupError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(VirtupError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| VirtupError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;
    if num == 0 {
        return Err(VirtupError::Validation {
            message: "size must be greater than zero".into(),
        });
    }

    let unit = match suffix.as_str() {
        "" => "",
        "K" | "KB" => "K",
        "M" | "MB" => "M",
        "G" | "GB" => "G",
        "T" | "TB" => "T",
        _ => {
            return Err(VirtupError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use G, M, K, or T)"),
            });
        }
    };

    Ok(format!("{num}{unit}"))
}

/// Instance names double as libvirt domain names and metadata file names.
pub fn validate_name(name: &str) -> Result<(), VirtupError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(VirtupError::InvalidName { name: name.into() });
    }
    Ok(())
}

/// Derive a safe instance name from a template name.
/// E.g. `generic/centos 8` → `generic-centos-8`
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_start_matches(['-', '.', '_'])
        .to_string()
}
