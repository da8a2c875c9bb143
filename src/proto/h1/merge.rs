//! Duplicate request-header coalescing.
//!
//! Request headers are byte ranges into the connection receive buffer, so
//! multi-occurrence headers are merged by shifting buffer bytes in place and
//! rewriting the recorded ranges, never by re-allocating the views. One
//! `memmove` per duplicate, on the hottest parse path.

use std::cmp::Ordering;

use bytes::BytesMut;

use crate::request::HeaderIndices;

/// List-style merge: append `,` then the duplicate value.
const SEP_LIST: u8 = b',';
/// Cookie concatenation (RFC 6265 §5.4).
const SEP_COOKIE: u8 = b';';
/// Space join (User-Agent tokens).
const SEP_SPACE: u8 = b' ';
/// Keep-last: the duplicate replaces the first value.
const SEP_OVERRIDE: u8 = b'O';
/// Duplicates forbidden; the request is malformed.
const SEP_FORBIDDEN: u8 = 0;

/// Sorted case-insensitively so lookup is a binary search.
static POLICY: &[(&str, u8)] = &[
    ("Accept", SEP_LIST),
    ("Accept-Charset", SEP_LIST),
    ("Accept-Encoding", SEP_LIST),
    ("Accept-Language", SEP_LIST),
    ("Authorization", SEP_OVERRIDE),
    ("Cache-Control", SEP_LIST),
    ("Connection", SEP_LIST),
    ("Content-Length", SEP_FORBIDDEN),
    ("Cookie", SEP_COOKIE),
    ("Expect", SEP_LIST),
    ("Forwarded", SEP_LIST),
    ("From", SEP_OVERRIDE),
    ("Host", SEP_FORBIDDEN),
    ("If-Match", SEP_LIST),
    ("If-Modified-Since", SEP_OVERRIDE),
    ("If-None-Match", SEP_LIST),
    ("If-Range", SEP_OVERRIDE),
    ("If-Unmodified-Since", SEP_OVERRIDE),
    ("Max-Forwards", SEP_OVERRIDE),
    ("Pragma", SEP_LIST),
    ("Proxy-Authorization", SEP_OVERRIDE),
    ("Range", SEP_OVERRIDE),
    ("Referer", SEP_OVERRIDE),
    ("TE", SEP_LIST),
    ("Trailer", SEP_LIST),
    ("Transfer-Encoding", SEP_LIST),
    ("Upgrade", SEP_LIST),
    ("User-Agent", SEP_SPACE),
    ("Via", SEP_LIST),
    ("Warning", SEP_LIST),
];

fn cmp_ignore_case(a: &[u8], b: &[u8]) -> Ordering {
    let common = a.len().min(b.len());
    for idx in 0..common {
        let ordering = a[idx]
            .to_ascii_lowercase()
            .cmp(&b[idx].to_ascii_lowercase());
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

/// Separator sentinel for a request header name.
///
/// Unknown headers optimistically follow the common `1#element` list pattern
/// when `merge_unknown` is set; otherwise their duplicates are rejected.
fn separator_for(name: &[u8], merge_unknown: bool) -> u8 {
    match POLICY.binary_search_by(|(entry, _)| cmp_ignore_case(entry.as_bytes(), name)) {
        Ok(idx) => POLICY[idx].1,
        Err(_) if merge_unknown => SEP_LIST,
        Err(_) => SEP_FORBIDDEN,
    }
}

/// Signals a duplicate of a header whose duplicates are forbidden (400).
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MergeForbidden;

/// Coalesces duplicate headers in place.
///
/// `head` holds exactly the request head; `entries` holds one entry per
/// parsed header line, ranges into `head`. On return `entries` has one entry
/// per distinct name and every range is valid for the (possibly grown) head.
pub(crate) fn coalesce_headers(
    head: &mut BytesMut,
    entries: &mut Vec<HeaderIndices>,
    merge_unknown: bool,
) -> Result<(), MergeForbidden> {
    let mut kept: Vec<HeaderIndices> = Vec::with_capacity(entries.len());
    let parsed = std::mem::take(entries);
    let mut pending = parsed.into_iter();

    while let Some(entry) = pending.next() {
        let found = kept.iter().position(|prior| {
            cmp_ignore_case(
                &head[prior.name.0..prior.name.1],
                &head[entry.name.0..entry.name.1],
            ) == Ordering::Equal
        });
        let Some(first_idx) = found else {
            kept.push(entry);
            continue;
        };

        let sep = separator_for(&head[entry.name.0..entry.name.1], merge_unknown);
        if sep == SEP_FORBIDDEN {
            return Err(MergeForbidden);
        }

        let first = &mut kept[first_idx];
        if first.value.0 == first.value.1 || sep == SEP_OVERRIDE {
            // Keep-last, or the first value was empty: repoint the view.
            first.value = entry.value;
            continue;
        }
        if entry.value.0 == entry.value.1 {
            // Empty duplicate adds nothing.
            continue;
        }

        // Stage the duplicate value: the shift below moves its bytes.
        let staged = head[entry.value.0..entry.value.1].to_vec();
        let first_end = first.value.1;
        let delta = staged.len() + 1;

        let old_len = head.len();
        head.resize(old_len + delta, 0);
        head.copy_within(first_end..old_len, first_end + delta);
        head[first_end] = sep;
        head[first_end + 1..first_end + delta].copy_from_slice(&staged);
        kept[first_idx].value.1 = first_end + delta;

        // Every view whose line lies in the shifted region moves with it.
        let shift = |indices: &mut HeaderIndices| {
            if indices.name.0 > first_end {
                indices.name.0 += delta;
                indices.name.1 += delta;
                indices.value.0 += delta;
                indices.value.1 += delta;
            }
        };
        kept.iter_mut().for_each(shift);
        pending = {
            let mut rest: Vec<HeaderIndices> = pending.collect();
            rest.iter_mut().for_each(shift);
            rest.into_iter()
        };
    }

    *entries = kept;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_lines(raw: &[u8]) -> (BytesMut, Vec<HeaderIndices>) {
        let head = BytesMut::from(raw);
        let mut entries = Vec::new();
        let mut offset = 0;
        for line in raw.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                break;
            }
            let colon = line.iter().position(|&b| b == b':').unwrap();
            let mut value_start = colon + 1;
            while value_start < line.len() && line[value_start] == b' ' {
                value_start += 1;
            }
            entries.push(HeaderIndices {
                name: (offset, offset + colon),
                value: (offset + value_start, offset + line.len()),
            });
            offset += line.len() + 2;
        }
        (head, entries)
    }

    fn value_of<'a>(head: &'a BytesMut, entries: &[HeaderIndices], name: &str) -> Option<&'a [u8]> {
        entries.iter().find_map(|entry| {
            if head[entry.name.0..entry.name.1].eq_ignore_ascii_case(name.as_bytes()) {
                Some(&head[entry.value.0..entry.value.1])
            } else {
                None
            }
        })
    }

    #[test]
    fn policy_table_is_sorted() {
        for window in POLICY.windows(2) {
            assert_eq!(
                cmp_ignore_case(window[0].0.as_bytes(), window[1].0.as_bytes()),
                Ordering::Less,
                "{} must sort before {}",
                window[0].0,
                window[1].0,
            );
        }
    }

    #[test]
    fn list_headers_merge_with_comma() {
        let (mut head, mut entries) =
            parse_lines(b"Accept-Encoding: gzip\r\nAccept-Encoding: br\r\n\r\n");
        coalesce_headers(&mut head, &mut entries, false).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(value_of(&head, &entries, "accept-encoding"), Some(&b"gzip,br"[..]));
    }

    #[test]
    fn merge_preserves_later_views() {
        let (mut head, mut entries) = parse_lines(
            b"Accept: a\r\nUser-Agent: curl\r\nAccept: b\r\nX-Last: ok\r\n\r\n",
        );
        coalesce_headers(&mut head, &mut entries, true).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(value_of(&head, &entries, "accept"), Some(&b"a,b"[..]));
        assert_eq!(value_of(&head, &entries, "user-agent"), Some(&b"curl"[..]));
        assert_eq!(value_of(&head, &entries, "x-last"), Some(&b"ok"[..]));
    }

    #[test]
    fn three_occurrences_join_in_order() {
        let (mut head, mut entries) = parse_lines(
            b"Cache-Control: no-cache\r\nCache-Control: no-store\r\nCache-Control: max-age=0\r\n\r\n",
        );
        coalesce_headers(&mut head, &mut entries, false).unwrap();
        assert_eq!(
            value_of(&head, &entries, "cache-control"),
            Some(&b"no-cache,no-store,max-age=0"[..])
        );
    }

    #[test]
    fn cookie_joins_with_semicolon() {
        let (mut head, mut entries) = parse_lines(b"Cookie: a=1\r\nCookie: b=2\r\n\r\n");
        coalesce_headers(&mut head, &mut entries, false).unwrap();
        assert_eq!(value_of(&head, &entries, "cookie"), Some(&b"a=1;b=2"[..]));
    }

    #[test]
    fn user_agent_joins_with_space() {
        let (mut head, mut entries) =
            parse_lines(b"User-Agent: Mozilla/5.0\r\nUser-Agent: (X11)\r\n\r\n");
        coalesce_headers(&mut head, &mut entries, false).unwrap();
        assert_eq!(
            value_of(&head, &entries, "user-agent"),
            Some(&b"Mozilla/5.0 (X11)"[..])
        );
    }

    #[test]
    fn override_keeps_last() {
        let (mut head, mut entries) =
            parse_lines(b"Range: bytes=0-1\r\nRange: bytes=2-3\r\n\r\n");
        coalesce_headers(&mut head, &mut entries, false).unwrap();
        assert_eq!(value_of(&head, &entries, "range"), Some(&b"bytes=2-3"[..]));
    }

    #[test]
    fn duplicate_host_forbidden() {
        let (mut head, mut entries) = parse_lines(b"Host: a\r\nHost: b\r\n\r\n");
        assert_eq!(
            coalesce_headers(&mut head, &mut entries, true),
            Err(MergeForbidden)
        );
    }

    #[test]
    fn duplicate_content_length_forbidden() {
        let (mut head, mut entries) =
            parse_lines(b"Content-Length: 1\r\nContent-Length: 1\r\n\r\n");
        assert_eq!(
            coalesce_headers(&mut head, &mut entries, false),
            Err(MergeForbidden)
        );
    }

    #[test]
    fn empty_first_value_replaced() {
        let (mut head, mut entries) = parse_lines(b"Accept:\r\nAccept: b\r\n\r\n");
        coalesce_headers(&mut head, &mut entries, false).unwrap();
        assert_eq!(value_of(&head, &entries, "accept"), Some(&b"b"[..]));
    }

    #[test]
    fn empty_duplicate_ignored() {
        let (mut head, mut entries) = parse_lines(b"Accept: a\r\nAccept:\r\n\r\n");
        coalesce_headers(&mut head, &mut entries, false).unwrap();
        assert_eq!(value_of(&head, &entries, "accept"), Some(&b"a"[..]));
    }

    #[test]
    fn unknown_header_policy_depends_on_flag() {
        let (mut head, mut entries) = parse_lines(b"X-Custom: a\r\nX-Custom: b\r\n\r\n");
        coalesce_headers(&mut head, &mut entries, true).unwrap();
        assert_eq!(value_of(&head, &entries, "x-custom"), Some(&b"a,b"[..]));

        let (mut head, mut entries) = parse_lines(b"X-Custom: a\r\nX-Custom: b\r\n\r\n");
        assert_eq!(
            coalesce_headers(&mut head, &mut entries, false),
            Err(MergeForbidden)
        );
    }

    #[test]
    fn every_range_stays_inside_buffer() {
        let (mut head, mut entries) = parse_lines(
            b"Accept: a\r\nVia: 1.1 x\r\nAccept: bcd\r\nVia: 1.1 y\r\nAccept: e\r\n\r\n",
        );
        coalesce_headers(&mut head, &mut entries, false).unwrap();
        for entry in &entries {
            assert!(entry.name.1 <= head.len());
            assert!(entry.value.1 <= head.len());
            assert!(entry.name.0 < entry.name.1);
        }
        assert_eq!(value_of(&head, &entries, "accept"), Some(&b"a,bcd,e"[..]));
        assert_eq!(value_of(&head, &entries, "via"), Some(&b"1.1 x,1.1 y"[..]));
    }
}
