//! Logical page labels: roman numerals and compact range notation.

const ROMAN: [(u32, &str); 13] = [
    (1000, "m"),
    (900, "cm"),
    (500, "d"),
    (400, "cd"),
    (100, "c"),
    (90, "xc"),
    (50, "l"),
    (40, "xl"),
    (10, "x"),
    (9, "ix"),
    (5, "v"),
    (4, "iv"),
    (1, "i"),
];

/// Lowercase roman numeral for `n` (1..4000).
pub fn to_roman(mut n: u32) -> String {
    let mut out = String::new();
    for (value, digits) in ROMAN {
        while n >= value {
            out.push_str(digits);
            n -= value;
        }
    }
    out
}

/// Parse a roman numeral in either case. Non-canonical forms are rejected.
pub fn from_roman(s: &str) -> Option<u32> {
    let lower = s.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return None;
    }
    let mut rest = lower.as_str();
    let mut total = 0;
    for (value, digits) in ROMAN {
        while let Some(tail) = rest.strip_prefix(digits) {
            total += value;
            rest = tail;
        }
    }
    if !rest.is_empty() || total == 0 || to_roman(total) != lower {
        return None;
    }
    Some(total)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Numeral {
    Arabic,
    Roman,
}

fn classify(label: &str) -> Option<(Numeral, u32)> {
    if let Ok(n) = label.trim().parse::<u32>() {
        return Some((Numeral::Arabic, n));
    }
    from_roman(label).map(|n| (Numeral::Roman, n))
}

/// Print a contiguous run compactly.
///
/// Arabic ends of equal length drop the prefix they share: `217--47`,
/// `450--5`. Roman runs print both ends. A single page prints alone.
pub fn prettify(start: u32, end: u32, roman: bool) -> String {
    if roman {
        return if start == end {
            to_roman(start)
        } else {
            format!("{}--{}", to_roman(start), to_roman(end))
        };
    }
    if start == end {
        return start.to_string();
    }
    let s = start.to_string();
    let e = end.to_string();
    if s.len() != e.len() {
        return format!("{s}--{e}");
    }
    let shared = s
        .chars()
        .zip(e.chars())
        .take_while(|(a, b)| a == b)
        .count();
    format!("{s}--{}", &e[shared..])
}

/// Compact form of a list of labels, e.g. `["10","11","12","13","17","18","19"]`
/// → `"10--3, 17--9"`. Unparseable labels are printed verbatim.
pub fn pretty_page_range(pages: &[String]) -> String {
    let mut parts = Vec::new();
    let mut run: Option<(Numeral, u32, u32)> = None;

    let flush = |run: Option<(Numeral, u32, u32)>, parts: &mut Vec<String>| {
        if let Some((kind, start, end)) = run {
            parts.push(prettify(start, end, kind == Numeral::Roman));
        }
    };

    for label in pages {
        match classify(label) {
            Some((kind, n)) => match run {
                Some((k, start, end)) if k == kind && n == end + 1 => {
                    run = Some((k, start, n));
                }
                _ => {
                    flush(run.take(), &mut parts);
                    run = Some((kind, n, n));
                }
            },
            None => {
                flush(run.take(), &mut parts);
                parts.push(label.clone());
            }
        }
    }
    flush(run, &mut parts);
    parts.join(", ")
}

/// Expand compact notation back to individual labels. Roman ranges expand in
/// roman.
pub fn deprettify(range: &str) -> Vec<String> {
    let mut pages = Vec::new();
    for part in range.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let normalized = part.replace("--", "-").replace('–', "-");
        let Some((start, end)) = normalized.split_once('-') else {
            pages.push(part.to_string());
            continue;
        };
        let (start, end) = (start.trim(), end.trim());
        if let (Ok(s), Ok(_)) = (start.parse::<u32>(), end.parse::<u32>()) {
            let end = if end.len() < start.len() {
                format!("{}{}", &start[..start.len() - end.len()], end)
            } else {
                end.to_string()
            };
            let e: u32 = end.parse().unwrap_or(s);
            pages.extend((s..=e.max(s)).map(|p| p.to_string()));
        } else if let (Some(s), Some(e)) = (from_roman(start), from_roman(end)) {
            pages.extend((s..=e.max(s)).map(to_roman));
        } else {
            pages.push(part.to_string());
        }
    }
    pages
}
