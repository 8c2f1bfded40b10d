//! Keyword and amount rules used to interpret free-text model replies.
//!
//! The defaults cover Spanish-language bank mail. A JSON file can replace
//! any of the lists; omitted fields keep their defaults.

use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::types::{Category, Priority};

/// Keywords that mark a reply as belonging to one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryKeywords {
    pub category: Category,
    pub keywords: Vec<String>,
}

/// Raw, serializable rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationRules {
    pub urgent_keywords: Vec<String>,
    pub low_priority_keywords: Vec<String>,
    /// Checked in order; the first category with a hit wins.
    pub category_keywords: Vec<CategoryKeywords>,
    /// Currency regexes, tried in order. Capture group 1 (if any) is the number.
    pub amount_patterns: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            urgent_keywords: strings(&[
                "pago pendiente",
                "pago vencido",
                "acción requerida",
                "urgente",
                "importante",
                "verificación requerida",
                "confirma tu",
                "por vencer",
                "último día",
                "fecha límite",
                "cobro próximo",
                "cargo próximo",
                "saldo insuficiente",
                "cuenta bloqueada",
                "suspensión",
            ]),
            low_priority_keywords: strings(&[
                "promoción",
                "oferta",
                "descuento",
                "newsletter",
                "boletín",
                "tips",
                "consejos",
                "beneficios",
                "programa de puntos",
                "invitación",
                "evento",
                "encuesta",
                "noticia",
                "sin_prioridad",
                "sin prioridad",
            ]),
            category_keywords: vec![
                CategoryKeywords {
                    category: Category::Pago,
                    keywords: strings(&["pago", "cargo", "compra", "domiciliación"]),
                },
                CategoryKeywords {
                    category: Category::Transferencia,
                    keywords: strings(&["transferencia", "depósito", "spei"]),
                },
                CategoryKeywords {
                    category: Category::EstadoCuenta,
                    keywords: strings(&["estado de cuenta", "estado_cuenta", "resumen"]),
                },
                CategoryKeywords {
                    category: Category::Movimiento,
                    keywords: strings(&["movimiento", "retiro"]),
                },
                CategoryKeywords {
                    category: Category::Promocion,
                    keywords: strings(&["promoción", "oferta", "descuento"]),
                },
            ],
            amount_patterns: strings(&[
                r"\$\s*(\d[\d,]*(?:\.\d{1,2})?)",
                r"\b(?:mxn|usd|eur)\s*\$?\s*(\d[\d,]*(?:\.\d{1,2})?)",
                r"(\d[\d,]*(?:\.\d{1,2})?)\s*(?:pesos|mxn|usd|eur)\b",
                r"(?:total|monto|importe|cantidad|cargo)\s*:\s*\$?\s*(\d[\d,]*(?:\.\d{1,2})?)",
            ]),
        }
    }
}

impl ClassificationRules {
    /// Load overrides from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            ConfigError::ParseError(format!("rules file {}: {e}", path.display()))
        })
    }

    /// Load from `path` when given, otherwise the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                tracing::info!(path = %p.display(), "Loading classification rules");
                Self::from_file(p)
            }
            None => Ok(Self::default()),
        }
    }

    /// Fold keywords and compile regexes for matching.
    pub fn compile(&self) -> Result<CompiledRules, ConfigError> {
        let fold_all = |words: &[String]| -> Vec<String> {
            words
                .iter()
                .map(|w| fold(w))
                .filter(|w| !w.is_empty())
                .collect()
        };

        let amount_patterns = self
            .amount_patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){p}")).map_err(|e| ConfigError::InvalidValue {
                    key: "amount_patterns".to_string(),
                    message: format!("'{p}': {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledRules {
            urgent: fold_all(&self.urgent_keywords),
            low_priority: fold_all(&self.low_priority_keywords),
            categories: self
                .category_keywords
                .iter()
                .map(|c| (c.category, fold_all(&c.keywords)))
                .collect(),
            amount_patterns,
        })
    }
}

/// Lowercase and strip Spanish diacritics so "Acción" matches "accion".
pub fn fold(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// Matching-ready rules.
#[derive(Debug, Clone)]
pub struct CompiledRules {
    urgent: Vec<String>,
    low_priority: Vec<String>,
    categories: Vec<(Category, Vec<String>)>,
    amount_patterns: Vec<Regex>,
}

impl CompiledRules {
    pub fn defaults() -> Self {
        // The built-in patterns are known to compile.
        match ClassificationRules::default().compile() {
            Ok(rules) => rules,
            Err(_) => Self {
                urgent: Vec::new(),
                low_priority: Vec::new(),
                categories: Vec::new(),
                amount_patterns: Vec::new(),
            },
        }
    }

    /// Priority implied by keywords, urgent taking precedence.
    pub fn priority_in(&self, text: &str) -> Option<Priority> {
        let folded = fold(text);
        if self.urgent.iter().any(|k| folded.contains(k.as_str())) {
            Some(Priority::Urgente)
        } else if self.low_priority.iter().any(|k| folded.contains(k.as_str())) {
            Some(Priority::SinPrioridad)
        } else {
            None
        }
    }

    /// First category whose keywords appear in `text`.
    pub fn category_in(&self, text: &str) -> Option<Category> {
        let folded = fold(text);
        self.categories
            .iter()
            .find(|(_, words)| words.iter().any(|k| folded.contains(k.as_str())))
            .map(|(category, _)| *category)
    }

    /// First currency amount in `text`, normalised to a decimal.
    pub fn amount_in(&self, text: &str) -> Option<Decimal> {
        let folded = fold(text);
        self.amount_patterns.iter().find_map(|re| {
            re.captures_iter(&folded).find_map(|caps| {
                let raw = caps.get(1).or_else(|| caps.get(0))?.as_str();
                normalize_amount(raw)
            })
        })
    }
}

/// "1,234.56" / "1.234,56" / "$ 1500" / "1500." → Decimal.
///
/// When both separators appear, the last one is the decimal point. A lone
/// comma followed by one or two digits is decimal, otherwise commas group
/// thousands. Negative amounts and exponents are rejected.
pub fn normalize_amount(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.starts_with('-') {
        return None;
    }
    let core = raw.trim_matches(|c: char| !c.is_ascii_digit());
    if core.is_empty() || !core.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return None;
    }

    let decimal_sep = match (core.rfind('.'), core.rfind(',')) {
        (Some(dot), Some(comma)) => Some(if dot > comma { '.' } else { ',' }),
        (None, Some(comma)) => {
            let frac = core.len() - comma - 1;
            (core.matches(',').count() == 1 && (1..=2).contains(&frac)).then_some(',')
        }
        (Some(_), None) => (core.matches('.').count() == 1).then_some('.'),
        (None, None) => None,
    };

    let normalized: String = core
        .chars()
        .filter_map(|c| match c {
            '0'..='9' => Some(c),
            _ if Some(c) == decimal_sep => Some('.'),
            _ => None,
        })
        .collect();
    Decimal::from_str(&normalized).ok()
}
