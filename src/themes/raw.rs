use std::fs::File;
use std::path::Path;

use serde::Deserialize;

use crate::error::TintaResult;

/// A TextMate theme as parsed from JSON: an ordered list of settings entries.
///
/// ```json
/// {
///   "name": "Example",
///   "settings": [
///     { "settings": { "foreground": "#ABCDEF", "background": "#012345" } },
///     { "scope": "comment, string.quoted", "settings": { "fontStyle": "italic" } },
///     { "scope": ["keyword", "storage"], "settings": { "foreground": "#FF0000" } }
///   ]
/// }
/// ```
///
/// The first entry has no scope: it supplies the theme defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTheme {
    #[serde(default)]
    pub name: Option<String>,
    /// VSCode themes call this `tokenColors`, TextMate themes `settings`
    #[serde(default, alias = "tokenColors")]
    pub settings: Vec<RawThemeSetting>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawThemeSetting {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scope: Option<ScopeField>,
    #[serde(default)]
    pub settings: RawStyleSettings,
}

/// Scopes come as one comma-separated string or as an array of strings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScopeField {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStyleSettings {
    #[serde(default, rename = "fontStyle")]
    pub font_style: Option<String>,
    #[serde(default)]
    pub foreground: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
}

impl RawTheme {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> TintaResult<Self> {
        let file = File::open(path)?;
        let theme = serde_json::from_reader(file)?;
        Ok(theme)
    }
}
