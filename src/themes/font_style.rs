use serde::{Deserialize, Serialize};

/// Font styling flags, stored with the bit values the packed token metadata
/// uses: italic 1, bold 2, underline 4.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug,
)]
pub struct FontStyle {
    bits: u8,
}

impl FontStyle {
    pub const ITALIC: Self = Self { bits: 1 };
    pub const BOLD: Self = Self { bits: 2 };
    pub const UNDERLINE: Self = Self { bits: 4 };

    /// Returns an empty set of flags
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Returns `true` if all of the flags in `other` are contained within `self`
    pub const fn contains(&self, other: Self) -> bool {
        (self.bits & other.bits) == other.bits
    }

    pub fn insert(&mut self, other: Self) {
        self.bits |= other.bits;
    }

    pub const fn bits(&self) -> u8 {
        self.bits
    }

    /// Parses a theme `fontStyle` string. Only exact space-separated segments
    /// count, matching what themes actually contain.
    pub fn parse(font_style: &str) -> Self {
        let mut out = Self::empty();
        for segment in font_style.split(' ') {
            match segment {
                "italic" => out.insert(FontStyle::ITALIC),
                "bold" => out.insert(FontStyle::BOLD),
                "underline" => out.insert(FontStyle::UNDERLINE),
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segments() {
        let style = FontStyle::parse("bold italic");
        assert!(style.contains(FontStyle::BOLD));
        assert!(style.contains(FontStyle::ITALIC));
        assert!(!style.contains(FontStyle::UNDERLINE));
    }

    #[test]
    fn unknown_segments_are_ignored() {
        assert!(FontStyle::parse("strikethrough").is_empty());
        assert_eq!(FontStyle::parse(""), FontStyle::empty());
    }
}
