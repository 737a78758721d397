//! `FormatMessage` insert semantics for message templates.

/// Render `template` with `inserts` the way `FormatMessage` does with
/// `FORMAT_MESSAGE_ARGUMENT_ARRAY`.
///
/// - `%1` .. `%99` insert the matching argument (missing arguments render empty). A trailing
///   `!fmt!` printf spec is consumed; every insert is already a string.
/// - `%0` ends the message without a trailing newline.
/// - `%n` is a hard line break (`\r\n`), `%r` a bare CR, `%t` a tab, `%b` and `% ` a space.
/// - `%%` is a literal percent sign, `%` followed by anything else renders that character.
///
/// Trailing CR/LF, which message compilers append to every entry, is trimmed.
pub fn format_message<S: AsRef<str>>(template: &str, inserts: &[S]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let Some(&(_, next)) = chars.peek() else {
            out.push('%');
            break;
        };

        match next {
            '0' => break,
            '1'..='9' => {
                chars.next();
                let mut index = next as usize - '0' as usize;
                if let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() {
                        index = index * 10 + (d as usize - '0' as usize);
                        chars.next();
                    }
                }

                // Skip an optional `!printf-spec!`.
                if let Some(&(start, '!')) = chars.peek() {
                    let rest = &template[start + 1..];
                    if let Some(end) = rest.find('!') {
                        let skip = rest[..end].chars().count() + 2;
                        for _ in 0..skip {
                            chars.next();
                        }
                    }
                }

                if let Some(insert) = inserts.get(index - 1) {
                    out.push_str(insert.as_ref());
                }
            }
            'n' => {
                chars.next();
                out.push_str("\r\n");
            }
            'r' => {
                chars.next();
                out.push('\r');
            }
            't' => {
                chars.next();
                out.push('\t');
            }
            'b' | ' ' => {
                chars.next();
                out.push(' ');
            }
            other => {
                chars.next();
                out.push(other);
            }
        }
    }

    let trimmed = out.trim_end_matches(['\r', '\n']).len();
    out.truncate(trimmed);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_positional_inserts() {
        assert_eq!(
            format_message(
                "The %1 service entered the %2 state.\r\n",
                &["Windows Update", "running"]
            ),
            "The Windows Update service entered the running state."
        );
        assert_eq!(format_message("%2 before %1", &["a", "b"]), "b before a");
    }

    #[test]
    fn test_missing_insert_renders_empty() {
        assert_eq!(format_message("[%1][%3]", &["x"]), "[x][]");
        let none: [&str; 0] = [];
        assert_eq!(format_message("no inserts %1.", &none), "no inserts .");
    }

    #[test]
    fn test_two_digit_insert_and_printf_spec() {
        let inserts: Vec<String> = (1..=12).map(|i| format!("v{i}")).collect();
        assert_eq!(format_message("%12 %1!s! %2!d!x", &inserts), "v12 v1 v2x");
        // An unterminated spec is kept as text.
        assert_eq!(format_message("%1!s", &inserts), "v1!s");
    }

    #[test]
    fn test_escapes() {
        let none: [&str; 0] = [];
        assert_eq!(format_message("100%% done", &none), "100% done");
        assert_eq!(format_message("a%nb%tc%bd% e", &none), "a\r\nb\tc d e");
        assert_eq!(format_message("a%rb", &none), "a\rb");
        assert_eq!(format_message("%. %!", &none), ". !");
        assert_eq!(format_message("stop%0 ignored", &none), "stop");
        assert_eq!(format_message("trailing %", &none), "trailing %");
    }

    #[test]
    fn test_trims_trailing_line_breaks_only() {
        let none: [&str; 0] = [];
        assert_eq!(format_message("line\r\n\r\n", &none), "line");
        assert_eq!(format_message("  spaced  \r\n", &none), "  spaced  ");
    }
}
