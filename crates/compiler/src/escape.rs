//! String literal escape decoding.
//!
//! The scanner only recognises escapes; this module decodes them when the
//! compiler turns a string token into an interned constant. Supported
//! forms: `\a \b \e \f \n \r \t \v \\ \' \" \0`, `\xHH`, `\uHHHH`, and
//! `\UHHHHHH`.

/// Decode the body of a string literal (quotes already stripped).
pub fn decode_string(body: &str) -> Result<String, &'static str> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        let esc = chars.next().ok_or("Invalid escape sequence")?;
        match esc {
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'e' => out.push('\u{1B}'),
            'f' => out.push('\u{0C}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{0B}'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            '0' => out.push('\0'),
            'x' => out.push(hex_escape(&mut chars, 2)?),
            'u' => out.push(hex_escape(&mut chars, 4)?),
            'U' => out.push(hex_escape(&mut chars, 6)?),
            _ => return Err("Invalid escape sequence"),
        }
    }

    Ok(out)
}

fn hex_escape(chars: &mut std::str::Chars<'_>, digits: u32) -> Result<char, &'static str> {
    let mut value: u32 = 0;
    for _ in 0..digits {
        let c = chars.next().ok_or("Invalid escape sequence")?;
        let digit = c.to_digit(16).ok_or("Invalid escape sequence")?;
        value = value * 16 + digit;
    }
    char::from_u32(value).ok_or("Invalid Unicode escape")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_escapes() {
        assert_eq!(decode_string("a\\nb\\tc").unwrap(), "a\nb\tc");
        assert_eq!(decode_string("\\\"quoted\\\"").unwrap(), "\"quoted\"");
        assert_eq!(decode_string("bell\\a").unwrap(), "bell\u{07}");
    }

    #[test]
    fn test_hex_and_unicode_escapes() {
        assert_eq!(decode_string("\\x41").unwrap(), "A");
        assert_eq!(decode_string("\\xE9").unwrap(), "\u{e9}");
        assert_eq!(decode_string("\\u0394").unwrap(), "\u{0394}");
        assert_eq!(decode_string("\\U01F600").unwrap(), "\u{1F600}");
    }

    #[test]
    fn test_invalid_escapes() {
        assert!(decode_string("\\q").is_err());
        assert!(decode_string("\\x4").is_err());
        assert!(decode_string("\\uD800").is_err()); // surrogate
        assert!(decode_string("tail\\").is_err());
    }
}
