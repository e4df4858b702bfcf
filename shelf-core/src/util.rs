use std::borrow::Cow;

/// Escape a metadata string (title, author, series name, ...) for safe use as
/// a path component: forward/back slashes, NUL, and trailing dots/spaces are
/// replaced, matching the common "naming pattern" contract used by every
/// organizer-style tool in this space (see e.g. the sanitize-filename crate
/// used by `juanra-audiobook-forge`).
pub fn sanitize_path_component(name: &str) -> Cow<'_, str> {
    const FORBIDDEN: &[char] = &['/', '\\', '\0', ':', '*', '?', '"', '<', '>', '|'];
    if !name.chars().any(|c| FORBIDDEN.contains(&c)) && !name.ends_with('.') && !name.ends_with(' ')
    {
        return Cow::Borrowed(name);
    }
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if FORBIDDEN.contains(&c) {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    while out.ends_with('.') || out.ends_with(' ') {
        out.pop();
    }
    Cow::Owned(out)
}

/// Append a collision suffix (" (2)", " (3)", ...) before the file extension.
///
/// `attempt` is 1-based; `attempt == 1` returns `stem` unchanged (no suffix).
pub fn collision_suffix(stem: &str, attempt: u32) -> String {
    if attempt <= 1 {
        stem.to_string()
    } else {
        format!("{stem} ({attempt})")
    }
}

/// Map a file extension to the MIME content type used for audiobook assets.
///
/// Mirrors the teacher's `content_type_for_extension` in `util.rs`, narrowed
/// to the audio/text formats this system cares about.
pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "mp3" => "audio/mpeg",
        "m4a" | "m4b" => "audio/mp4",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "opus" => "audio/opus",
        "txt" | "nfo" => "text/plain",
        "xml" => "application/xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_leaves_clean_names_alone() {
        assert_eq!(sanitize_path_component("The Hobbit"), "The Hobbit");
    }

    #[test]
    fn sanitize_replaces_forbidden_characters() {
        assert_eq!(sanitize_path_component("Who: What?"), "Who_ What_");
    }

    #[test]
    fn sanitize_trims_trailing_dots_and_spaces() {
        assert_eq!(sanitize_path_component("Trailing. "), "Trailing");
    }

    #[test]
    fn collision_suffix_first_attempt_is_bare() {
        assert_eq!(collision_suffix("book", 1), "book");
    }

    #[test]
    fn collision_suffix_later_attempts_are_numbered() {
        assert_eq!(collision_suffix("book", 2), "book (2)");
        assert_eq!(collision_suffix("book", 3), "book (3)");
    }
}
