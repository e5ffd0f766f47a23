//! Destination tokenization and wildcard matching.
//!
//! Destinations split on both `.` and `/`. In a subscription pattern,
//! `*` matches exactly one segment and a trailing `**` matches the
//! remaining tail, including an empty one.

pub fn tokenize(destination: &str) -> Vec<String> {
    destination
        .split(['.', '/'])
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn matches(
    pattern: &[String],
    destination: &[String],
) -> bool {
    let mut position = 0;
    for segment in pattern {
        if segment == "**" {
            return true;
        }
        let Some(actual) = destination.get(position) else {
            return false;
        };
        if segment != "*" && segment != actual {
            return false;
        }
        position += 1;
    }
    position == destination.len()
}
