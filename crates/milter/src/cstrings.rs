use memchr::memchr;

/// Decode the bytes up to the first NUL, or the whole buffer if there is
/// none. Non-UTF8 payload bytes are replaced rather than rejected; header
/// and envelope data from the wild is not reliably clean.
pub(crate) fn read_cstring(data: &[u8]) -> String {
    let bytes = match memchr(0, data) {
        Some(pos) => &data[..pos],
        None => data,
    };
    String::from_utf8_lossy(bytes).into_owned()
}

/// Split a NUL-separated string sequence. Trailing NUL terminators are
/// trimmed before splitting, so `a\0b\0` and `a\0b` decode the same way and
/// `name\0\0` yields a synthesized empty value.
pub(crate) fn decode_cstrings(data: &[u8]) -> Vec<String> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut end = data.len();
    while end > 0 && data[end - 1] == 0 {
        end -= 1;
    }
    data[..end]
        .split(|&byte| byte == 0)
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .collect()
}

/// Append `s` followed by a single NUL terminator.
pub(crate) fn append_cstring(dest: &mut Vec<u8>, s: &str) {
    dest.extend_from_slice(s.as_bytes());
    dest.push(0);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_terminated_and_bare() {
        assert_eq!(read_cstring(b"host\0rest"), "host");
        assert_eq!(read_cstring(b"host"), "host");
        assert_eq!(read_cstring(b""), "");
        assert_eq!(read_cstring(b"\0"), "");
    }

    #[test]
    fn decode_round_trip() {
        let fields = ["from@example.org", "A=B", ""];
        let mut encoded = Vec::new();
        for field in &fields {
            append_cstring(&mut encoded, field);
        }
        assert_eq!(decode_cstrings(&encoded), fields);
    }

    #[test]
    fn decode_empty_is_empty_sequence() {
        assert_eq!(decode_cstrings(b""), Vec::<String>::new());
    }

    #[test]
    fn decode_trims_trailing_nuls_only() {
        assert_eq!(decode_cstrings(b"a\0b\0"), ["a", "b"]);
        assert_eq!(decode_cstrings(b"a\0b"), ["a", "b"]);
        // A header with an empty value arrives as name\0\0.
        assert_eq!(decode_cstrings(b"name\0\0"), ["name"]);
        assert_eq!(decode_cstrings(b"\0"), [""]);
        assert_eq!(decode_cstrings(b"\0name\0"), ["", "name"]);
    }
}
