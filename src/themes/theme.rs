//! Theme resolution: parsed rules, the color palette and the scope trie.
//!
//! A theme is rebuilt wholesale on every change; nothing in here mutates
//! after construction except the per-scope query cache.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{Error, TintaResult};
use crate::scope::Scope;
use crate::themes::font_style::FontStyle;
use crate::themes::raw::{RawTheme, ScopeField};

/// One theme entry after flattening: a single target scope, its ancestor
/// requirements (nearest ancestor first) and the styling it asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedThemeRule {
    pub scope: String,
    /// Required ancestor scopes, most specific (nearest) first
    pub parent_scopes: Option<Vec<String>>,
    /// Position of the entry in the theme file, the final sort tie-breaker
    pub index: usize,
    /// `None` means the entry does not set a font style
    pub font_style: Option<FontStyle>,
    pub foreground: Option<String>,
    pub background: Option<String>,
}

fn is_valid_hex_color(hex: &str) -> bool {
    let Some(digits) = hex.strip_prefix('#') else {
        return false;
    };
    matches!(digits.len(), 3 | 4 | 6 | 8) && digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Flattens a raw theme into one rule per (scope, entry) pair.
/// Invalid colors are dropped here, silently: themes in the wild contain
/// things like `inherit` and empty strings.
pub fn parse_theme(raw: &RawTheme) -> Vec<ParsedThemeRule> {
    let mut result = Vec::new();

    for (index, entry) in raw.settings.iter().enumerate() {
        let scopes: Vec<String> = match &entry.scope {
            Some(ScopeField::One(s)) => s
                .trim_matches(',')
                .split(',')
                .map(|part| part.to_owned())
                .collect(),
            Some(ScopeField::Many(list)) => list.clone(),
            None => vec![String::new()],
        };

        let font_style = entry.settings.font_style.as_deref().map(FontStyle::parse);
        let foreground = entry
            .settings
            .foreground
            .clone()
            .filter(|c| is_valid_hex_color(c));
        let background = entry
            .settings
            .background
            .clone()
            .filter(|c| is_valid_hex_color(c));

        for scope_expression in &scopes {
            let mut segments: Vec<&str> = scope_expression.split_whitespace().collect();
            let scope = segments.pop().unwrap_or("").to_owned();
            let parent_scopes = if segments.is_empty() {
                None
            } else {
                // nearest ancestor first
                segments.reverse();
                Some(segments.into_iter().map(|s| s.to_owned()).collect())
            };

            result.push(ParsedThemeRule {
                scope,
                parent_scopes,
                index,
                font_style,
                foreground: foreground.clone(),
                background: background.clone(),
            });
        }
    }

    result
}

fn str_arr_cmp(a: &Option<Vec<String>>, b: &Option<Vec<String>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}

/// Bidirectional color <-> id map. Id 0 is reserved for "unset".
///
/// Built from a precomputed palette the map is frozen: asking for a color it
/// doesn't contain is an error rather than a silent mis-render.
#[derive(Debug, Clone)]
pub struct ColorMap {
    frozen: bool,
    id_to_color: Vec<String>,
    color_to_id: HashMap<String, u32>,
}

impl Default for ColorMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ColorMap {
    pub fn new() -> Self {
        Self {
            frozen: false,
            // slot 0 stays empty so real ids start at 1
            id_to_color: vec![String::new()],
            color_to_id: HashMap::new(),
        }
    }

    pub fn frozen(palette: Vec<String>) -> Self {
        let color_to_id = palette
            .iter()
            .enumerate()
            .map(|(index, color)| (color.to_uppercase(), index as u32))
            .collect();
        Self {
            frozen: true,
            id_to_color: palette,
            color_to_id,
        }
    }

    /// Looks a color up, registering it when the map is growable.
    /// Case-insensitive; `None` maps to the reserved id 0.
    pub fn id(&mut self, color: Option<&str>) -> TintaResult<u32> {
        let Some(color) = color else {
            return Ok(0);
        };
        let normalized = color.to_uppercase();

        if let Some(&id) = self.color_to_id.get(&normalized) {
            return Ok(id);
        }
        if self.frozen {
            return Err(Error::ColorNotFound(normalized));
        }

        let id = self.id_to_color.len() as u32;
        self.id_to_color.push(normalized.clone());
        self.color_to_id.insert(normalized, id);
        Ok(id)
    }

    pub fn color(&self, id: u32) -> Option<&str> {
        self.id_to_color.get(id as usize).map(|s| s.as_str())
    }

    pub fn colors(&self) -> Vec<String> {
        self.id_to_color.clone()
    }
}

/// A rule as stored in (and returned from) the trie: styling plus the
/// specificity data queries are ordered by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeTrieRule {
    /// How many scope segments were matched to reach this rule
    pub scope_depth: u32,
    /// Required ancestors, nearest first; `None` for the node's main rule
    pub parent_scopes: Option<Vec<String>>,
    pub font_style: Option<FontStyle>,
    /// Palette id, 0 = unset
    pub foreground: u32,
    pub background: u32,
}

impl ThemeTrieRule {
    fn accept_overwrite(
        &mut self,
        scope_depth: u32,
        font_style: Option<FontStyle>,
        foreground: u32,
        background: u32,
    ) {
        if self.scope_depth > scope_depth {
            log::warn!("theme trie rule inserted with a smaller depth than it already has");
        } else {
            self.scope_depth = scope_depth;
        }
        if let Some(fs) = font_style {
            self.font_style = Some(fs);
        }
        if foreground != 0 {
            self.foreground = foreground;
        }
        if background != 0 {
            self.background = background;
        }
    }
}

fn cmp_by_specificity(a: &ThemeTrieRule, b: &ThemeTrieRule) -> Ordering {
    if a.scope_depth == b.scope_depth {
        let a_parents = a.parent_scopes.as_deref().unwrap_or(&[]);
        let b_parents = b.parent_scopes.as_deref().unwrap_or(&[]);
        if a_parents.len() == b_parents.len() {
            for (a_segment, b_segment) in a_parents.iter().zip(b_parents) {
                if a_segment.len() != b_segment.len() {
                    return b_segment.len().cmp(&a_segment.len());
                }
            }
        }
        return b_parents.len().cmp(&a_parents.len());
    }
    b.scope_depth.cmp(&a.scope_depth)
}

#[derive(Debug, Clone)]
struct ThemeTrieNode {
    main_rule: ThemeTrieRule,
    rules_with_parent_scopes: Vec<ThemeTrieRule>,
    children: HashMap<String, ThemeTrieNode>,
}

fn split_head(scope: &str) -> (&str, &str) {
    match scope.find('.') {
        Some(dot) => (&scope[..dot], &scope[dot + 1..]),
        None => (scope, ""),
    }
}

impl ThemeTrieNode {
    fn new(main_rule: ThemeTrieRule) -> Self {
        Self {
            main_rule,
            rules_with_parent_scopes: Vec::new(),
            children: HashMap::new(),
        }
    }

    fn insert(
        &mut self,
        scope_depth: u32,
        scope: &str,
        parent_scopes: Option<Vec<String>>,
        font_style: Option<FontStyle>,
        foreground: u32,
        background: u32,
    ) {
        if scope.is_empty() {
            self.insert_here(scope_depth, parent_scopes, font_style, foreground, background);
            return;
        }

        let (head, tail) = split_head(scope);
        let main_rule = &self.main_rule;
        let parent_rules = &self.rules_with_parent_scopes;
        let child = self.children.entry(head.to_owned()).or_insert_with(|| {
            // a fresh child starts from what its parent resolves to, so every
            // node always has a usable main rule
            ThemeTrieNode {
                main_rule: main_rule.clone(),
                rules_with_parent_scopes: parent_rules.clone(),
                children: HashMap::new(),
            }
        });

        child.insert(
            scope_depth + 1,
            tail,
            parent_scopes,
            font_style,
            foreground,
            background,
        );
    }

    fn insert_here(
        &mut self,
        scope_depth: u32,
        parent_scopes: Option<Vec<String>>,
        font_style: Option<FontStyle>,
        foreground: u32,
        background: u32,
    ) {
        let Some(parents) = parent_scopes else {
            self.main_rule
                .accept_overwrite(scope_depth, font_style, foreground, background);
            return;
        };

        // merge into an existing rule with the same ancestor requirements
        if let Some(existing) = self
            .rules_with_parent_scopes
            .iter_mut()
            .find(|rule| rule.parent_scopes.as_ref() == Some(&parents))
        {
            existing.accept_overwrite(scope_depth, font_style, foreground, background);
            return;
        }

        // a new ancestor-qualified rule inherits whatever it leaves unset
        // from the node's main rule
        self.rules_with_parent_scopes.push(ThemeTrieRule {
            scope_depth,
            parent_scopes: Some(parents),
            font_style: font_style.or(self.main_rule.font_style),
            foreground: if foreground == 0 {
                self.main_rule.foreground
            } else {
                foreground
            },
            background: if background == 0 {
                self.main_rule.background
            } else {
                background
            },
        });
    }

    fn match_scope(&self, scope: &str) -> Vec<ThemeTrieRule> {
        if !scope.is_empty() {
            let (head, tail) = split_head(scope);
            if let Some(child) = self.children.get(head) {
                return child.match_scope(tail);
            }
            // unknown segment: fall back to the nearest ancestor node
        }

        let mut rules = Vec::with_capacity(1 + self.rules_with_parent_scopes.len());
        rules.push(self.main_rule.clone());
        rules.extend(self.rules_with_parent_scopes.iter().cloned());
        rules.sort_by(cmp_by_specificity);
        rules
    }
}

/// Concrete styling for one scope path, resolved against a theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StyleAttributes {
    pub font_style: FontStyle,
    /// Palette id, never 0 once resolved
    pub foreground: u32,
    pub background: u32,
}

/// A compiled theme: defaults, the scope trie and the color palette.
pub struct Theme {
    color_map: ColorMap,
    defaults: StyleAttributes,
    root: ThemeTrieNode,
    cache: papaya::HashMap<String, Vec<ThemeTrieRule>>,
}

impl Theme {
    pub fn from_raw(raw: &RawTheme) -> TintaResult<Theme> {
        Self::from_parsed(parse_theme(raw), None)
    }

    /// Builds against a precomputed palette; theme colors missing from the
    /// palette make this fail with [`Error::ColorNotFound`].
    pub fn from_raw_with_palette(raw: &RawTheme, palette: Vec<String>) -> TintaResult<Theme> {
        Self::from_parsed(parse_theme(raw), Some(palette))
    }

    pub fn from_parsed(
        mut rules: Vec<ParsedThemeRule>,
        palette: Option<Vec<String>>,
    ) -> TintaResult<Theme> {
        rules.sort_by(|a, b| {
            a.scope
                .cmp(&b.scope)
                .then_with(|| str_arr_cmp(&a.parent_scopes, &b.parent_scopes))
                .then_with(|| a.index.cmp(&b.index))
        });

        // scope-less entries sort first and feed the defaults
        let mut default_font_style = FontStyle::empty();
        let mut default_foreground = "#000000".to_owned();
        let mut default_background = "#ffffff".to_owned();
        let mut first_real_rule = 0;
        while first_real_rule < rules.len() && rules[first_real_rule].scope.is_empty() {
            let incoming = &rules[first_real_rule];
            if let Some(fs) = incoming.font_style {
                default_font_style = fs;
            }
            if let Some(fg) = &incoming.foreground {
                default_foreground = fg.clone();
            }
            if let Some(bg) = &incoming.background {
                default_background = bg.clone();
            }
            first_real_rule += 1;
        }

        let mut color_map = match palette {
            Some(palette) => ColorMap::frozen(palette),
            None => ColorMap::new(),
        };
        let defaults = StyleAttributes {
            font_style: default_font_style,
            foreground: color_map.id(Some(&default_foreground))?,
            background: color_map.id(Some(&default_background))?,
        };

        let mut root = ThemeTrieNode::new(ThemeTrieRule {
            scope_depth: 0,
            parent_scopes: None,
            font_style: None,
            foreground: 0,
            background: 0,
        });
        for rule in &rules[first_real_rule..] {
            root.insert(
                0,
                &rule.scope,
                rule.parent_scopes.clone(),
                rule.font_style,
                color_map.id(rule.foreground.as_deref())?,
                color_map.id(rule.background.as_deref())?,
            );
        }

        Ok(Theme {
            color_map,
            defaults,
            root,
            cache: papaya::HashMap::new(),
        })
    }

    /// The theme defaults, returned alongside (never instead of) per-scope
    /// matches.
    pub fn defaults(&self) -> StyleAttributes {
        self.defaults
    }

    pub fn color_map(&self) -> Vec<String> {
        self.color_map.colors()
    }

    pub fn color(&self, id: u32) -> Option<&str> {
        self.color_map.color(id)
    }

    /// All rules applicable to a scope name, most specific first.
    /// Results are cached per exact scope string.
    pub fn match_scope(&self, scope: &str) -> Vec<ThemeTrieRule> {
        let cache = self.cache.pin();
        if let Some(cached) = cache.get(scope) {
            return cached.clone();
        }
        let rules = self.root.match_scope(scope);
        cache.insert(scope.to_owned(), rules.clone());
        rules
    }

    /// Resolves the concrete style of a full scope path, outer to inner,
    /// honoring ancestor-qualified rules along the way.
    pub fn resolve_path(&self, scopes: &[Scope]) -> StyleAttributes {
        let mut style = self.defaults;

        for (depth, &scope) in scopes.iter().enumerate() {
            let rules = self.match_scope(&scope.build_string());
            let ancestors = &scopes[..depth];
            let Some(rule) = rules
                .iter()
                .find(|rule| parents_match(rule.parent_scopes.as_deref(), ancestors))
            else {
                continue;
            };

            if let Some(fs) = rule.font_style {
                style.font_style = fs;
            }
            if rule.foreground != 0 {
                style.foreground = rule.foreground;
            }
            if rule.background != 0 {
                style.background = rule.background;
            }
        }

        style
    }
}

/// Ancestor requirements match when each required parent (nearest first)
/// prefix-matches some open scope, walking the ancestor chain inward-out.
fn parents_match(parent_scopes: Option<&[String]>, ancestors: &[Scope]) -> bool {
    let Some(parents) = parent_scopes else {
        return true;
    };

    let mut remaining = ancestors.len();
    'parents: for parent in parents {
        let parent_scope = Scope::new(parent);
        while remaining > 0 {
            remaining -= 1;
            if parent_scope.is_prefix_of(ancestors[remaining]) {
                continue 'parents;
            }
        }
        return false;
    }
    true
}
