//! Compiled pattern programs.
//!
//! A [`RulePatterns`] is the ordered alternative list one rule scans with:
//! the rule's reachable leaf patterns plus, for begin/end rules, the end
//! pattern at position 0 (or last under `applyEndPatternLast`). Each program
//! keeps a fixed 4-slot cache of compiled scanners, one per anchor variant,
//! dropped wholesale whenever a back-reference substitution changes the end
//! source.

use onig::{RegSet, RegSetLead, RegexOptions, SearchOptions};

use crate::error::{Error, TintaResult};
use crate::grammars::{RegexSource, RuleId};
use crate::tokenizer::anchors::AnchorActive;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScanMatch {
    pub rule_id: RuleId,
    pub start: usize,
    pub end: usize,
    /// Per-group byte offsets, absolute within the scanned line
    pub capture_pos: Vec<Option<(usize, usize)>>,
}

/// A batch-compiled scanner over one alternative list.
pub(crate) struct CompiledScanner {
    rule_ids: Vec<RuleId>,
    regset: Option<RegSet>,
}

impl CompiledScanner {
    fn compile(items: &[(RuleId, &str)]) -> TintaResult<Self> {
        if items.is_empty() {
            return Ok(Self {
                rule_ids: Vec::new(),
                regset: None,
            });
        }

        let rule_ids = items.iter().map(|(id, _)| *id).collect();
        let sources: Vec<&str> = items.iter().map(|(_, source)| *source).collect();

        let regset = RegSet::with_options(&sources, RegexOptions::REGEX_OPTION_CAPTURE_GROUP)
            .map_err(|e| {
                Error::TokenizeRegex(format!(
                    "failed to compile pattern set with {} patterns: {:?}",
                    sources.len(),
                    e
                ))
            })?;

        Ok(Self {
            rule_ids,
            regset: Some(regset),
        })
    }

    /// Leftmost-first match among all alternatives at or after `pos`.
    /// The whole line is passed so lookbehind keeps working.
    pub fn find_next_match(&self, text: &str, pos: usize) -> Option<ScanMatch> {
        let regset = self.regset.as_ref()?;

        let (pattern_index, captures) = regset.captures_with_options(
            text,
            pos,
            text.len(),
            RegSetLead::Position,
            SearchOptions::SEARCH_OPTION_NONE,
        )?;
        let (start, end) = captures.pos(0)?;
        let capture_pos = (0..captures.len()).map(|i| captures.pos(i)).collect();

        Some(ScanMatch {
            rule_id: self.rule_ids[pattern_index],
            start,
            end,
            capture_pos,
        })
    }
}

enum SourceSlot<'g> {
    Fixed(&'g RegexSource),
    /// End/while source freshly rebuilt from resolved back-references
    Resolved(RegexSource),
}

impl SourceSlot<'_> {
    fn get(&self) -> &RegexSource {
        match self {
            SourceSlot::Fixed(source) => source,
            SourceSlot::Resolved(source) => source,
        }
    }
}

pub(crate) struct RulePatterns<'g> {
    items: Vec<SourceSlot<'g>>,
    end_slot: Option<usize>,
    default_end: Option<&'g RegexSource>,
    /// The substituted end source currently in place, `None` when the rule's
    /// own source is
    current_end_source: Option<String>,
    has_anchors: bool,
    cache: [Option<CompiledScanner>; 4],
}

impl<'g> RulePatterns<'g> {
    pub fn new(items: Vec<&'g RegexSource>) -> Self {
        let has_anchors = items.iter().any(|source| source.has_anchor());
        Self {
            items: items.into_iter().map(SourceSlot::Fixed).collect(),
            end_slot: None,
            default_end: None,
            current_end_source: None,
            has_anchors,
            cache: Default::default(),
        }
    }

    pub fn with_end(
        items: Vec<&'g RegexSource>,
        end: &'g RegexSource,
        apply_end_pattern_last: bool,
    ) -> Self {
        let mut patterns = Self::new(items);
        patterns.has_anchors |= end.has_anchor();
        patterns.default_end = Some(end);
        if apply_end_pattern_last {
            patterns.items.push(SourceSlot::Fixed(end));
            patterns.end_slot = Some(patterns.items.len() - 1);
        } else {
            patterns.items.insert(0, SourceSlot::Fixed(end));
            patterns.end_slot = Some(0);
        }
        patterns
    }

    /// A program holding only a while pattern, checked at line starts.
    pub fn for_while(while_source: &'g RegexSource) -> Self {
        let mut patterns = Self::new(vec![while_source]);
        patterns.default_end = Some(while_source);
        patterns.end_slot = Some(0);
        patterns
    }

    /// Swaps the end/while slot to a back-reference-resolved source
    /// (`None` restores the rule's own source). A changed source busts all
    /// four compiled variants.
    pub fn set_end_source(&mut self, resolved: Option<&str>) {
        if self.current_end_source.as_deref() == resolved {
            return;
        }
        let Some(slot) = self.end_slot else {
            return;
        };
        let Some(default_end) = self.default_end else {
            return;
        };

        self.items[slot] = match resolved {
            Some(source) => {
                SourceSlot::Resolved(RegexSource::new(source.to_owned(), default_end.rule_id()))
            }
            None => SourceSlot::Fixed(default_end),
        };
        self.current_end_source = resolved.map(|s| s.to_owned());
        self.has_anchors = self.items.iter().any(|slot| slot.get().has_anchor());
        self.cache = Default::default();
    }

    pub fn compile(&mut self, anchors: AnchorActive) -> TintaResult<&CompiledScanner> {
        // anchor-free programs only ever need one compiled form
        let index = if self.has_anchors {
            anchors.cache_index()
        } else {
            0
        };

        if self.cache[index].is_none() {
            let items: Vec<(RuleId, &str)> = self
                .items
                .iter()
                .map(|slot| {
                    let source = slot.get();
                    (
                        source.rule_id(),
                        source.resolve_anchors(anchors.allow_a(), anchors.allow_g()),
                    )
                })
                .collect();
            self.cache[index] = Some(CompiledScanner::compile(&items)?);
        }

        match &self.cache[index] {
            Some(scanner) => Ok(scanner),
            None => unreachable!("scanner cache slot filled above"),
        }
    }
}
