/// Lower-cases `input` and joins its alphanumeric runs with `-`.
///
/// Non-ASCII letters are dropped; an input without any usable characters
/// yields `"item"` so callers always get a non-empty slug.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;

    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    if slug.is_empty() {
        "item".to_string()
    } else {
        slug
    }
}

/// Candidate slugs for `base`: `base`, `base-2`, `base-3`, ...
pub fn candidates(base: &str) -> impl Iterator<Item = String> + '_ {
    std::iter::once(base.to_string()).chain((2u32..).map(move |n| format!("{base}-{n}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_separators() {
        assert_eq!(slugify("  Senior Rust Engineer (Remote)!  "), "senior-rust-engineer-remote");
        assert_eq!(slugify("ACME--Corp"), "acme-corp");
    }

    #[test]
    fn falls_back_for_empty_input() {
        assert_eq!(slugify("¡¿!"), "item");
        assert_eq!(slugify(""), "item");
    }

    #[test]
    fn candidates_are_numbered_from_two() {
        let list: Vec<_> = candidates("acme").take(3).collect();
        assert_eq!(list, vec!["acme", "acme-2", "acme-3"]);
    }
}
