use crate::status::DispatchError;
use std::collections::HashMap;

/// Form fields in arrival order per name.
pub type MultiMap = HashMap<String, Vec<String>>;

/// Parses an `application/x-www-form-urlencoded` body.
pub fn parse_form(body: &[u8]) -> MultiMap {
    let mut fields = MultiMap::new();
    for (name, value) in url::form_urlencoded::parse(body) {
        fields
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    fields
}

/// Decodes `body` in the named charset. UTF-8 is strict; the single-byte
/// Latin charsets map each byte onto the code point of the same value.
pub fn decode(body: &[u8], charset: &str) -> Result<String, DispatchError> {
    match charset.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => String::from_utf8(body.to_vec())
            .map_err(|e| DispatchError::conversion("body", e.to_string())),
        "iso-8859-1" | "latin1" | "latin-1" => Ok(body.iter().map(|b| char::from(*b)).collect()),
        "us-ascii" | "ascii" => {
            if let Some(position) = body.iter().position(|b| !b.is_ascii()) {
                return Err(DispatchError::conversion(
                    "body",
                    format!("non-ASCII byte at offset {}", position),
                ));
            }
            Ok(body.iter().map(|b| char::from(*b)).collect())
        }
        other => Err(DispatchError::conversion(
            "body",
            format!("unsupported charset '{}'", other),
        )),
    }
}

/// Encodes `text` for a response declared in `charset`. Characters the
/// single-byte charsets cannot hold become `?`; unknown charsets get UTF-8.
pub fn encode(text: &str, charset: &str) -> Vec<u8> {
    let limit = match charset.to_ascii_lowercase().as_str() {
        "iso-8859-1" | "latin1" | "latin-1" => 0xFF,
        "us-ascii" | "ascii" => 0x7F,
        _ => return text.as_bytes().to_vec(),
    };
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).ok().filter(|b| u32::from(*b) <= limit).unwrap_or(b'?'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_keeps_repeated_fields() {
        let form = parse_form(b"foo=1&bar=2&foo=3&name=J%C3%BCrgen+M");
        assert_eq!(form["foo"], vec!["1", "3"]);
        assert_eq!(form["bar"], vec!["2"]);
        assert_eq!(form["name"], vec!["Jürgen M"]);
        assert!(parse_form(b"").is_empty());
    }

    #[test]
    fn decodes_supported_charsets() {
        assert_eq!(decode("grüß".as_bytes(), "UTF-8").unwrap(), "grüß");
        assert_eq!(decode(&[0x67, 0xFC], "ISO-8859-1").unwrap(), "gü");
        assert!(decode(&[0xFF, 0xFE], "utf-8").is_err());
        assert!(decode(&[0xFC], "US-ASCII").is_err());
        assert!(decode(b"x", "koi8-r").is_err());
    }

    #[test]
    fn encodes_single_byte_charsets_lossily() {
        assert_eq!(encode("gü€", "ISO-8859-1"), vec![0x67, 0xFC, b'?']);
        assert_eq!(encode("gü", "us-ascii"), b"g?".to_vec());
        assert_eq!(encode("gü", "UTF-8"), "gü".as_bytes().to_vec());
    }
}
