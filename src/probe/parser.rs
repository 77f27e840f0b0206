//! AT reply parsing
//!
//! Modem replies arrive as raw bytes with an echoed command, surrounding
//! whitespace and a trailing `OK`. The helpers here reduce them to the
//! identifiers the probe is after.

/// Strip the `OK` terminator, surrounding whitespace and any echoed command
/// from a reply.
///
/// Total and idempotent: when the input carries no `OK` the whole buffer is
/// cleaned, and echo stripping repeats until a fixpoint, so applying
/// `clean_reply` to its own output changes nothing. The transport layer has
/// already required `OK` before parsing ever runs.
pub fn clean_reply(src: &[u8]) -> &[u8] {
    let mut body = match find(src, b"OK") {
        Some(i) => &src[..i],
        None => src,
    }
    .trim_ascii();

    // Some modems echo the command back; drop everything through the CR
    // that terminates the echoed line.
    while body.first().is_some_and(|b| b.is_ascii_alphabetic()) {
        let Some(at) = find(body, b"AT") else { break };
        let Some(cr) = body[at..].iter().position(|&b| b == b'\r') else {
            break;
        };
        body = body[at + cr + 1..].trim_ascii();
    }

    body
}

/// Extract the IMEI from an `ATI` reply: the whitespace-trimmed run of
/// decimal digits between `IMEI:` and the `+GCAP` capability line.
pub fn parse_imei(src: &str) -> Option<String> {
    let src = src.trim();
    let start = src.find("IMEI:")? + "IMEI:".len();
    let rest = &src[start..];
    let end = rest.find("+GCAP")?;
    let imei = rest[..end].trim();
    is_digits(imei).then(|| imei.to_string())
}

/// Extract the IMSI from an `AT+CIMI` reply
pub fn parse_imsi(src: &[u8]) -> Option<String> {
    let imsi = std::str::from_utf8(clean_reply(src)).ok()?;
    is_digits(imsi).then(|| imsi.to_string())
}

/// Non-empty and all decimal digits
pub fn is_digits(src: &str) -> bool {
    !src.is_empty() && src.chars().all(|c| c.is_ascii_digit())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
