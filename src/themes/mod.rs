mod font_style;
mod raw;
mod theme;

pub use font_style::FontStyle;
pub use raw::{RawStyleSettings, RawTheme, RawThemeSetting, ScopeField};
pub use theme::{ColorMap, ParsedThemeRule, StyleAttributes, Theme, ThemeTrieRule, parse_theme};
