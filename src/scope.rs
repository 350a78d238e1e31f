//! Interned scope names.
//!
//! A scope like `string.quoted.double.js` is packed into a single u128:
//! 8 slots of 16 bits, each holding `atom_table_index + 1` (0 = unused slot),
//! first segment in the most significant slot so that comparing the u128
//! compares scopes lexicographically segment by segment.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

pub const MAX_ATOMS: usize = 8;
const MAX_ATOM_TABLE_SIZE: usize = 65534;

/// An interned, dot-segmented scope name such as `comment.block.rust`.
///
/// Copyable and comparable in O(1); the segment strings live in a global
/// atom table. Scopes with more than 8 segments keep only the first 8.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Copy, Default, Hash)]
pub struct Scope {
    atoms: u128,
}

impl Scope {
    pub fn new(s: &str) -> Scope {
        let mut repo = lock_atom_table();
        repo.build(s.trim())
    }

    /// Parses a space-separated list of scope names, as found in grammar
    /// `name` fields that attach several scopes at once.
    pub fn parse_list(s: &str) -> Vec<Scope> {
        let mut repo = lock_atom_table();
        s.split_whitespace().map(|part| repo.build(part)).collect()
    }

    /// The packed atom at `index` (0-7): 0 for unused, table index + 1 otherwise.
    #[inline]
    fn atom_at(self, index: usize) -> u16 {
        debug_assert!(index < MAX_ATOMS);
        let shift = (MAX_ATOMS - 1 - index) * 16;
        ((self.atoms >> shift) & 0xFFFF) as u16
    }

    /// Number of segments in this scope.
    #[inline]
    pub fn len(self) -> u32 {
        MAX_ATOMS as u32 - self.unused_slots()
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.atoms == 0
    }

    /// Unused slots sit in the low bits, so they show up as trailing zeros.
    #[inline]
    fn unused_slots(self) -> u32 {
        self.atoms.trailing_zeros() / 16
    }

    /// Dot-boundary prefix test: `string.quoted` is a prefix of
    /// `string.quoted.double` but not of `string.quotedx`.
    ///
    /// This is the core operation of selector and theme matching so it has to
    /// stay O(1): mask away the slots this scope doesn't use and compare.
    #[inline]
    pub fn is_prefix_of(self, other: Scope) -> bool {
        let unused = self.unused_slots();

        if unused == MAX_ATOMS as u32 {
            return true;
        }

        let mask_shift = unused * 16;
        let mask = if mask_shift >= 128 {
            0u128
        } else {
            u128::MAX << mask_shift
        };

        (self.atoms ^ other.atoms) & mask == 0
    }

    /// Rebuilds the string form. Expensive, meant for display and for the
    /// theme trie which walks scope names segment by segment.
    pub fn build_string(self) -> String {
        let repo = lock_atom_table();
        repo.to_string(self)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope(\"{}\")", self.build_string())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build_string())
    }
}

/// Global table mapping segment strings to dense indices.
struct AtomTable {
    atoms: Vec<String>,
    atom_index: HashMap<String, usize>,
}

impl AtomTable {
    fn new() -> Self {
        Self {
            atoms: Vec::new(),
            atom_index: HashMap::new(),
        }
    }

    fn atom_to_index(&mut self, atom: &str) -> usize {
        if let Some(&index) = self.atom_index.get(atom) {
            return index;
        }

        assert!(
            self.atoms.len() < MAX_ATOM_TABLE_SIZE,
            "scope atom table overflow"
        );

        let index = self.atoms.len();
        self.atoms.push(atom.to_owned());
        self.atom_index.insert(atom.to_owned(), index);
        index
    }

    fn atom_str(&self, atom_number: u16) -> &str {
        debug_assert!(atom_number > 0);
        &self.atoms[(atom_number - 1) as usize]
    }

    fn build(&mut self, s: &str) -> Scope {
        if s.is_empty() {
            return Scope::default();
        }

        let mut atoms = 0u128;
        for (i, atom_str) in s.split('.').take(MAX_ATOMS).enumerate() {
            if atom_str.is_empty() {
                continue;
            }

            let atom_value = (self.atom_to_index(atom_str) + 1) as u128;
            let shift = (MAX_ATOMS - 1 - i) * 16;
            atoms |= atom_value << shift;
        }

        Scope { atoms }
    }

    fn to_string(&self, scope: Scope) -> String {
        let mut parts = Vec::new();

        for i in 0..MAX_ATOMS {
            let atom_number = scope.atom_at(i);
            if atom_number == 0 {
                break;
            }
            parts.push(self.atom_str(atom_number));
        }

        parts.join(".")
    }
}

static ATOM_TABLE: std::sync::LazyLock<Mutex<AtomTable>> =
    std::sync::LazyLock::new(|| Mutex::new(AtomTable::new()));

fn lock_atom_table() -> MutexGuard<'static, AtomTable> {
    ATOM_TABLE.lock().expect("failed to lock scope atom table")
}
