//! .NET deserialization gadget signatures.
//!
//! A rule is a list of literal tokens that must appear in the blob in order,
//! with any bytes (newlines included) between them. The catalog is plain data:
//! new signatures are added as TOML entries, not code.

use lazy_static::lazy_static;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::models::GadgetMatchResult;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("rule with empty name")]
    EmptyName,
    #[error("duplicate rule name: {0}")]
    DuplicateName(String),
    #[error("rule {0} has no tokens")]
    NoTokens(String),
    #[error("rule {0} has an empty token")]
    EmptyToken(String),
    #[error("failed to read rule catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse rule catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialise rule catalog: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// A literal byte string. In TOML it is either a plain string or
/// `{ hex = "..." }` for bytes that are not valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TokenRepr", into = "TokenRepr")]
pub struct Token(Vec<u8>);

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TokenRepr {
    Text(String),
    Hex { hex: String },
}

impl Token {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Token {
    fn from(text: &str) -> Self {
        Token(text.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Token {
    fn from(bytes: Vec<u8>) -> Self {
        Token(bytes)
    }
}

impl TryFrom<TokenRepr> for Token {
    type Error = hex::FromHexError;

    fn try_from(repr: TokenRepr) -> Result<Self, Self::Error> {
        match repr {
            TokenRepr::Text(text) => Ok(Token(text.into_bytes())),
            TokenRepr::Hex { hex } => Ok(Token(hex::decode(hex.replace(' ', ""))?)),
        }
    }
}

impl From<Token> for TokenRepr {
    fn from(token: Token) -> Self {
        match String::from_utf8(token.0) {
            Ok(text) => TokenRepr::Text(text),
            Err(e) => TokenRepr::Hex {
                hex: hex::encode(e.into_bytes()),
            },
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => write!(f, "{}", text),
            Err(_) => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GadgetRule {
    pub name: String,
    pub tokens: Vec<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl GadgetRule {
    pub fn new(name: &str, tokens: &[&str]) -> Self {
        GadgetRule {
            name: name.to_string(),
            tokens: tokens.iter().map(|t| Token::from(*t)).collect(),
            description: None,
        }
    }

    pub fn matches(&self, blob: &[u8]) -> bool {
        ordered_contains(blob, self.tokens.iter().map(|t| t.as_bytes()))
    }
}

/// True if every token occurs in `haystack`, each one starting after the end
/// of the previous one. Taking the leftmost hit for each token is enough: an
/// earlier end never rules out a later token.
pub fn ordered_contains<'a, I>(haystack: &[u8], tokens: I) -> bool
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut pos = 0;
    for token in tokens {
        match memchr::memmem::find(&haystack[pos..], token) {
            Some(at) => pos += at + token.len(),
            None => return false,
        }
    }
    true
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    rules: Vec<GadgetRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GadgetCatalog {
    rules: Vec<GadgetRule>,
}

impl GadgetCatalog {
    pub fn new(rules: Vec<GadgetRule>) -> Result<Self, CatalogError> {
        validate(&rules)?;
        Ok(GadgetCatalog { rules })
    }

    pub fn from_toml_str(data: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(data)?;
        Self::new(file.rules)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let data = fs::read_to_string(path)?;
        let catalog = Self::from_toml_str(&data)?;
        debug!("Loaded {} gadget rules from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    pub fn to_toml(&self) -> Result<String, CatalogError> {
        let file = CatalogFile {
            rules: self.rules.clone(),
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    /// Appends `other`'s rules; names must stay unique across both.
    pub fn extend(&mut self, other: GadgetCatalog) -> Result<(), CatalogError> {
        let mut merged = self.rules.clone();
        merged.extend(other.rules);
        validate(&merged)?;
        self.rules = merged;
        Ok(())
    }

    pub fn rules(&self) -> &[GadgetRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluates every rule against `blob`. Names come back in catalog order.
    pub fn scan(&self, blob: &[u8]) -> GadgetMatchResult {
        let names: Vec<String> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(blob))
            .map(|rule| rule.name.clone())
            .collect();
        if !names.is_empty() {
            debug!("Gadget signatures matched: {}", names.join(", "));
        }
        GadgetMatchResult { names }
    }
}

fn validate(rules: &[GadgetRule]) -> Result<(), CatalogError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if rule.name.trim().is_empty() {
            return Err(CatalogError::EmptyName);
        }
        if !seen.insert(rule.name.as_str()) {
            return Err(CatalogError::DuplicateName(rule.name.clone()));
        }
        if rule.tokens.is_empty() {
            return Err(CatalogError::NoTokens(rule.name.clone()));
        }
        if rule.tokens.iter().any(|t| t.is_empty()) {
            return Err(CatalogError::EmptyToken(rule.name.clone()));
        }
    }
    Ok(())
}

lazy_static! {
    static ref DEFAULT_CATALOG: GadgetCatalog = GadgetCatalog {
        rules: builtin_rules(),
    };
}

/// The built-in catalog, shared read-only by every worker.
pub fn default_catalog() -> &'static GadgetCatalog {
    &DEFAULT_CATALOG
}

fn builtin_rules() -> Vec<GadgetRule> {
    vec![
        GadgetRule::new(
            "ActivitySurrogateDisableTypeCheck",
            &["GetField", "disableActivitySurrogateSelectorTypeCheck", "SetValue", "setMethod"],
        ),
        GadgetRule::new(
            "ActivitySurrogateSelector",
            &["ActivitySurrogateSelector", "ObjectSurrogate", "ObjectSerializedRef"],
        ),
        GadgetRule::new("AxHostState", &["AxHost", "State", "Process", "Start"]),
        GadgetRule::new(
            "ClaimsIdentity",
            &["System.Security.Claims.ClaimsIdentity", "m_serializedClaims"],
        ),
        GadgetRule::new(
            "DataSet",
            &["System.Data.DataSet", "DataSet.Namespace", "System.Data.SerializationFormat"],
        ),
        GadgetRule::new("ObjectDataProvider2", &["ObjectInstance", "ObjectDataProvider"]),
        GadgetRule::new("ObjectDataProvider", &["ObjectDataProvider", "MethodName"]),
        GadgetRule::new(
            "PSObject",
            &["System.Management.Automation", "CimInstance", "RunspaceInvoke"],
        ),
        GadgetRule::new(
            "RolePrincipal",
            &["RolePrincipal", "System.Security.ClaimsPrincipal.Identities"],
        ),
        GadgetRule::new(
            "SessionSecurityToken",
            &["SecurityContextToken", "ClaimsPrincipal", "BootStrapToken"],
        ),
        GadgetRule::new(
            "SessionViewStateHistoryItem",
            &["System.Web.UI.MobileControls.SessionViewState", "SessionViewStateHistoryItem"],
        ),
        GadgetRule::new(
            "TextFormattingRunProperties",
            &["TextFormattingRunProperties", "ForegroundBrush"],
        ),
        GadgetRule::new(
            "TypeConfuseDelegate",
            &["System.DelegateSerializationHolder", "targetTypeAssembly"],
        ),
        GadgetRule::new(
            "TypeConfuseDelegateMono",
            &[
                "System.DelegateSerializationHolder",
                "System.Reflection.MemberInfoSerializationHolder",
                "targetTypeAssembly",
            ],
        ),
        GadgetRule::new(
            "WindowsIdentity",
            &["WindowsIdentity", "System.Security.ClaimsIdentity.actor"],
        ),
        GadgetRule::new(
            "WindowsPrincipal",
            &["WindowsPrincipal", "System.Security.ClaimsIdentity.actor"],
        ),
    ]
}
