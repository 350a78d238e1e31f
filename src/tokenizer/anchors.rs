use std::fmt;

/// Which position-dependent anchors may assert during one scan.
///
/// `\A` is only true at the very start of the document's first line and
/// `\G` only at the exact position the current rule was entered, so each
/// scan picks the matching precomputed source variant instead of letting
/// the engine guess.
#[derive(Copy, Clone, PartialEq, Hash, Eq)]
pub(crate) enum AnchorActive {
    /// Only \A is active
    A,
    /// Only \G is active
    G,
    /// Both \A and \G are active
    AG,
    /// Neither is active
    None,
}

impl AnchorActive {
    pub fn new(is_first_line: bool, anchor_position: i32, current_pos: usize) -> Self {
        let g_active = anchor_position >= 0 && anchor_position as usize == current_pos;

        match (is_first_line, g_active) {
            (true, true) => AnchorActive::AG,
            (true, false) => AnchorActive::A,
            (false, true) => AnchorActive::G,
            (false, false) => AnchorActive::None,
        }
    }

    pub fn allow_a(self) -> bool {
        matches!(self, AnchorActive::A | AnchorActive::AG)
    }

    pub fn allow_g(self) -> bool {
        matches!(self, AnchorActive::G | AnchorActive::AG)
    }

    /// Slot in the fixed 4-entry compiled-scanner cache
    pub fn cache_index(self) -> usize {
        (self.allow_a() as usize) << 1 | self.allow_g() as usize
    }
}

impl fmt::Debug for AnchorActive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnchorActive::A => "allow_A=true, allow_G=false",
            AnchorActive::G => "allow_A=false, allow_G=true",
            AnchorActive::AG => "allow_A=true, allow_G=true",
            AnchorActive::None => "allow_A=false, allow_G=false",
        };
        f.write_str(s)
    }
}
