//! The tokenizer's state between lines.
//!
//! A [`StateStack`] is a persistent singly-linked list of frames: pushing
//! allocates one new frame pointing at the unchanged parent, so callers can
//! keep any returned stack around forever (snapshots, undo, incremental
//! re-highlight) and share it across documents. There is no in-place
//! mutation anywhere.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::grammars::RuleId;
use crate::scope::Scope;

/// One open rule on the stack.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub parent: Option<Arc<Frame>>,
    pub depth: usize,
    pub rule_id: RuleId,
    /// Position the rule was entered at on the line it was pushed, -1 on any
    /// later line. Per-line scratch: excluded from equality.
    pub enter_pos: i32,
    /// `\G` base to restore for the parent when this frame pops. Per-line
    /// scratch as well.
    pub anchor_pos: i32,
    /// The begin match consumed the line's `\n`, so the next line re-anchors
    /// `\G` at position 0
    pub begin_rule_captured_eol: bool,
    /// End/while source with back-references substituted, when the rule has
    /// any
    pub end_rule: Option<String>,
    /// Scopes covering the whole rule, delimiters included
    pub name_scopes: Vec<Scope>,
    /// Scopes covering the text between the delimiters
    pub content_scopes: Vec<Scope>,
}

fn frame_eq(a: &Option<Arc<Frame>>, b: &Option<Arc<Frame>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            Arc::ptr_eq(a, b)
                || (a.rule_id == b.rule_id
                    && a.end_rule == b.end_rule
                    && a.name_scopes == b.name_scopes
                    && a.content_scopes == b.content_scopes
                    && frame_eq(&a.parent, &b.parent))
        }
        _ => false,
    }
}

/// Immutable tokenization state. [`StateStack::initial`] is the terminal
/// empty value every document starts from; equality is structural so two
/// stacks produced by tokenizing identical text compare equal.
#[derive(Debug, Clone, Default)]
pub struct StateStack {
    top: Option<Arc<Frame>>,
}

impl StateStack {
    /// The initial state for a fresh document.
    pub fn initial() -> StateStack {
        StateStack { top: None }
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_none()
    }

    pub fn depth(&self) -> usize {
        self.top.as_ref().map(|frame| frame.depth).unwrap_or(0)
    }

    pub(crate) fn from_frame(top: Option<Arc<Frame>>) -> StateStack {
        StateStack { top }
    }

    pub(crate) fn top(&self) -> Option<&Arc<Frame>> {
        self.top.as_ref()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn push(
        &self,
        rule_id: RuleId,
        enter_pos: i32,
        anchor_pos: i32,
        begin_rule_captured_eol: bool,
        end_rule: Option<String>,
        name_scopes: Vec<Scope>,
        content_scopes: Vec<Scope>,
    ) -> StateStack {
        StateStack {
            top: Some(Arc::new(Frame {
                parent: self.top.clone(),
                depth: self.depth() + 1,
                rule_id,
                enter_pos,
                anchor_pos,
                begin_rule_captured_eol,
                end_rule,
                name_scopes,
                content_scopes,
            })),
        }
    }

    /// The stack without its top frame; popping the empty stack stays empty.
    pub(crate) fn pop(&self) -> StateStack {
        StateStack {
            top: self.top.as_ref().and_then(|frame| frame.parent.clone()),
        }
    }

    /// A stack whose top frame has been replaced by an edited copy.
    pub(crate) fn with_top(&self, edit: impl FnOnce(&mut Frame)) -> StateStack {
        let Some(top) = &self.top else {
            return self.clone();
        };
        let mut frame = (**top).clone();
        edit(&mut frame);
        StateStack {
            top: Some(Arc::new(frame)),
        }
    }

    /// Frames from the root outward, for the while-guard cascade.
    pub(crate) fn frames_outermost_first(&self) -> Vec<Arc<Frame>> {
        let mut frames = Vec::with_capacity(self.depth());
        let mut current = self.top.clone();
        while let Some(frame) = current {
            current = frame.parent.clone();
            frames.push(frame);
        }
        frames.reverse();
        frames
    }

    /// Returned stacks carry no per-line positions: clear them, rebuilding
    /// only the frames that need it.
    pub(crate) fn reset_positions(&self) -> StateStack {
        fn reset(frame: &Arc<Frame>) -> Arc<Frame> {
            let parent = frame.parent.as_ref().map(reset);
            let parent_unchanged = match (&parent, &frame.parent) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if parent_unchanged && frame.enter_pos == -1 && frame.anchor_pos == -1 {
                return Arc::clone(frame);
            }
            let mut cleared = (**frame).clone();
            cleared.parent = parent;
            cleared.enter_pos = -1;
            cleared.anchor_pos = -1;
            Arc::new(cleared)
        }

        StateStack {
            top: self.top.as_ref().map(reset),
        }
    }
}

impl PartialEq for StateStack {
    fn eq(&self, other: &Self) -> bool {
        frame_eq(&self.top, &other.top)
    }
}

impl Eq for StateStack {}

impl Hash for StateStack {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut current = self.top.as_deref();
        while let Some(frame) = current {
            frame.rule_id.hash(state);
            frame.end_rule.hash(state);
            frame.name_scopes.hash(state);
            frame.content_scopes.hash(state);
            current = frame.parent.as_deref();
        }
    }
}
