//! tinta — an incremental TextMate-grammar tokenizer.
//!
//! Compiles declarative begin/end/while grammars into a flat rule graph,
//! tokenizes text one line at a time through an immutable, restartable
//! stack state, and resolves the resulting scope paths into styling via a
//! theme trie. The regex work is done by Oniguruma through `onig`'s RegSet
//! batch scanner.

mod error;
mod grammars;
mod matcher;
mod registry;
mod scope;
mod themes;
mod tokenizer;

pub use error::Error;
pub use grammars::{Captures, Grammar, RawGrammar, RawRule, RuleId};
pub use matcher::{Matcher, MatcherWithPriority, parse_matchers};
pub use registry::{GrammarConfiguration, GrammarSource, Registry};
pub use scope::Scope;
pub use themes::{
    ColorMap, FontStyle, ParsedThemeRule, RawStyleSettings, RawTheme, RawThemeSetting, ScopeField,
    StyleAttributes, Theme, ThemeTrieRule, parse_theme,
};
pub use tokenizer::{
    StandardTokenType, StateStack, Token, TokenizeLine2Result, TokenizeLineResult, Tokenizer,
    metadata,
};
