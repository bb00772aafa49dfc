//! Mapping extracted document fields onto form fields
//!
//! Each (document field, form field) pair is scored two ways on normalised
//! names: a fuzzy string score and a rule score from known field-name
//! patterns. The two are combined with a small bonus for compatible field
//! types into a confidence in `0..=1`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, warn};

use intellifill_llm::ExtractedField;

use crate::payload::FormField;

const FUZZY_WEIGHT: f64 = 0.3;
const RULE_WEIGHT: f64 = 0.3;
const TYPE_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Email,
    Phone,
    Date,
    Number,
    Currency,
    Address,
    Name,
    Boolean,
    Signature,
    Unknown,
}

impl FieldType {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("text") | Some("string") => Self::Text,
            Some("email") => Self::Email,
            Some("phone") | Some("tel") => Self::Phone,
            Some("date") => Self::Date,
            Some("number") | Some("integer") => Self::Number,
            Some("currency") | Some("money") => Self::Currency,
            Some("address") => Self::Address,
            Some("name") => Self::Name,
            Some("boolean") | Some("checkbox") => Self::Boolean,
            Some("signature") => Self::Signature,
            _ => Self::Unknown,
        }
    }

    /// Guess a type from a normalised field name
    fn from_name(name: &str) -> Self {
        let has = |terms: &[&str]| terms.iter().any(|t| name.contains(t));
        if has(&["email", "e-mail"]) {
            Self::Email
        } else if has(&["phone", "mobile", "tel"]) {
            Self::Phone
        } else if has(&["date", "birth", "dob"]) {
            Self::Date
        } else if has(&["name", "first", "last"]) {
            Self::Name
        } else if has(&["address", "street", "city"]) {
            Self::Address
        } else if has(&["amount", "price", "salary"]) {
            Self::Currency
        } else {
            Self::Text
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Fuzzy,
    RuleBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
    pub confidence: f64,
    pub field_type: FieldType,
    pub strategy: MatchStrategy,
    pub value: serde_json::Value,
    /// Whether `value` fits `field_type`
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Minimum confidence for a pair to be considered at all
    pub similarity_threshold: f64,
    /// Minimum confidence for the best candidate to be kept
    pub confidence_threshold: f64,
    pub max_suggestions: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            confidence_threshold: 0.6,
            max_suggestions: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldMapper {
    config: MappingConfig,
}

impl FieldMapper {
    pub fn new(config: MappingConfig) -> Self {
        Self { config }
    }

    pub fn map(&self, extracted: &[ExtractedField], form: &[FormField]) -> Vec<FieldMapping> {
        let targets: Vec<(String, FieldType)> = form
            .iter()
            .map(|f| (normalize(&f.name), FieldType::parse(f.field_type.as_deref())))
            .collect();

        let mut best_by_target: HashMap<&str, FieldMapping> = HashMap::new();
        for field in extracted {
            let source = normalize(&field.name);
            let source_type = FieldType::parse(field.field_type.as_deref());

            let mut candidates: Vec<FieldMapping> = form
                .iter()
                .zip(&targets)
                .filter_map(|(target, (target_norm, target_type))| {
                    let fuzzy = fuzzy_score(&source, target_norm);
                    let rule = rule_score(&source, target_norm);
                    let bonus = type_bonus(source_type, *target_type);
                    let confidence = ((FUZZY_WEIGHT * fuzzy + RULE_WEIGHT * rule + TYPE_WEIGHT * bonus)
                        / (FUZZY_WEIGHT + RULE_WEIGHT))
                        .min(1.0);
                    if confidence < self.config.similarity_threshold {
                        return None;
                    }

                    let strategy = if source == *target_norm {
                        MatchStrategy::Exact
                    } else if rule >= fuzzy {
                        MatchStrategy::RuleBased
                    } else {
                        MatchStrategy::Fuzzy
                    };
                    let field_type = resolve_type(source_type, *target_type, &source);
                    Some(FieldMapping {
                        source_field: field.name.clone(),
                        target_field: target.name.clone(),
                        confidence,
                        field_type,
                        strategy,
                        value: field.value.clone(),
                        valid: validate_value(field_type, &field.value),
                    })
                })
                .collect();

            candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            candidates.truncate(self.config.max_suggestions);
            let Some(best) = candidates.into_iter().next() else {
                continue;
            };
            if best.confidence < self.config.confidence_threshold {
                continue;
            }
            debug!(
                source = %best.source_field,
                target = %best.target_field,
                confidence = best.confidence,
                "Field mapped"
            );

            let Some(target) = form.iter().find(|f| f.name == best.target_field) else {
                continue;
            };
            match best_by_target.get(target.name.as_str()) {
                Some(existing) if existing.confidence >= best.confidence => {
                    warn!(
                        target = %target.name,
                        kept = %existing.source_field,
                        dropped = %best.source_field,
                        "Mapping conflict resolved"
                    );
                }
                Some(existing) => {
                    warn!(
                        target = %target.name,
                        kept = %best.source_field,
                        dropped = %existing.source_field,
                        "Mapping conflict resolved"
                    );
                    best_by_target.insert(target.name.as_str(), best);
                }
                None => {
                    best_by_target.insert(target.name.as_str(), best);
                }
            }
        }

        // Form order
        form.iter()
            .filter_map(|f| best_by_target.remove(f.name.as_str()))
            .collect()
    }
}

/// Lower-case, split camelCase and treat `_`, `-` and `.` as spaces
pub fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;
    for c in name.chars() {
        if matches!(c, '_' | '-' | '.') || c.is_whitespace() {
            out.push(' ');
        } else {
            if c.is_uppercase() && prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit()) {
                out.push(' ');
            }
            out.extend(c.to_lowercase());
        }
        prev = Some(c);
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut row = vec![0usize; b.len() + 1];
    for &ca in a {
        let mut diag = 0;
        for (j, &cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == cb { diag + 1 } else { above.max(row[j]) };
            diag = above;
        }
    }
    row[b.len()]
}

/// Indel similarity, `2·LCS / (|a| + |b|)`
fn ratio_chars(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * lcs_len(a, b) as f64 / total as f64
}

pub fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    ratio_chars(&a, &b)
}

/// Best ratio of the shorter string against equal-length windows of the longer
pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    if short.is_empty() {
        return 0.0;
    }
    long.windows(short.len())
        .map(|w| ratio_chars(short, w))
        .fold(0.0, f64::max)
}

pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let sorted = |s: &str| {
        let mut words: Vec<&str> = s.split_whitespace().collect();
        words.sort_unstable();
        words.join(" ")
    };
    ratio(&sorted(a), &sorted(b))
}

/// `0.4·ratio + 0.3·partial_ratio + 0.3·token_sort_ratio`
pub fn fuzzy_score(a: &str, b: &str) -> f64 {
    0.4 * ratio(a, b) + 0.3 * partial_ratio(a, b) + 0.3 * token_sort_ratio(a, b)
}

fn name_patterns() -> &'static [(Regex, Regex)] {
    static PATTERNS: OnceLock<Vec<(Regex, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(first|given).*name", r"(first|given).*name"),
            (r"(last|family|sur).*name", r"(last|family|sur).*name"),
            (r"full.*name", r"(full|complete).*name"),
            (r"email.*address", r"email"),
            (r"phone.*number", r"phone"),
            (r"mobile.*number", r"(mobile|cell)"),
            (r"street.*address", r"(street|address)"),
            (r"city", r"city"),
            (r"state", r"state"),
            (r"zip.*code", r"(zip|postal)"),
            (r"birth.*date", r"(birth|dob)"),
            (r"date.*birth", r"(birth|dob)"),
            (r"salary", r"(salary|income)"),
            (r"amount", r"amount"),
        ]
        .iter()
        .filter_map(|(doc, form)| Some((Regex::new(doc).ok()?, Regex::new(form).ok()?)))
        .collect()
    })
}

/// Rule score on normalised names
pub fn rule_score(doc: &str, form: &str) -> f64 {
    if doc == form {
        return 1.0;
    }
    let mut score: f64 = 0.0;
    if name_patterns()
        .iter()
        .any(|(d, f)| d.is_match(doc) && f.is_match(form))
    {
        score = 0.9;
    }
    if !doc.is_empty() && !form.is_empty() && (doc.contains(form) || form.contains(doc)) {
        score = score.max(0.7);
    }

    let doc_words: HashSet<&str> = doc.split_whitespace().collect();
    let form_words: HashSet<&str> = form.split_whitespace().collect();
    let union = doc_words.union(&form_words).count();
    if union > 0 {
        let jaccard = doc_words.intersection(&form_words).count() as f64 / union as f64;
        score = score.max(jaccard * 0.8);
    }
    score
}

fn type_bonus(a: FieldType, b: FieldType) -> f64 {
    use FieldType::*;
    if a == b && a != Unknown {
        return 0.2;
    }
    match (a, b) {
        (Number, Currency) | (Currency, Number) => 0.15,
        (Text, Name | Address | Email | Phone) | (Name | Address | Email | Phone, Text) => 0.1,
        _ => 0.0,
    }
}

fn resolve_type(source: FieldType, target: FieldType, source_name: &str) -> FieldType {
    if target != FieldType::Unknown {
        target
    } else if source != FieldType::Unknown {
        source
    } else {
        FieldType::from_name(source_name)
    }
}

fn value_patterns() -> &'static [Regex; 5] {
    static PATTERNS: OnceLock<[Regex; 5]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$",
            r"^\d{1,2}[/\-.]\d{1,2}[/\-.]\d{2,4}$",
            r"^\d{4}[/\-.]\d{1,2}[/\-.]\d{1,2}$",
            r"(?i)^\d{1,2}\s+(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)\s+\d{4}$",
            r"^\$?[\d,]+\.?\d{0,2}$",
        ]
        .map(|p| Regex::new(p).expect("valid value pattern"))
    })
}

/// Check a value against the format its field type expects
pub fn validate_value(field_type: FieldType, value: &serde_json::Value) -> bool {
    let text = match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Null => return false,
        other => other.to_string(),
    };
    let [email, date_dmy, date_ymd, date_text, currency] = value_patterns();
    match field_type {
        FieldType::Email => email.is_match(&text),
        FieldType::Phone => {
            let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
            (10..=12).contains(&digits)
        }
        FieldType::Date => [date_dmy, date_ymd, date_text].iter().any(|re| re.is_match(&text)),
        FieldType::Number => text.replace(',', "").parse::<f64>().is_ok(),
        FieldType::Currency => currency.is_match(&text.replace(' ', "")),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_field(name: &str, value: &str, field_type: &str) -> ExtractedField {
        ExtractedField {
            name: name.into(),
            value: json!(value),
            field_type: Some(field_type.into()),
            confidence: 0.9,
        }
    }

    fn form_field(name: &str, field_type: &str) -> FormField {
        FormField {
            name: name.into(),
            field_type: Some(field_type.into()),
            required: false,
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("firstName"), "first name");
        assert_eq!(normalize("applicant_first_name"), "applicant first name");
        assert_eq!(normalize("Date-Of.Birth"), "date of birth");
        assert_eq!(normalize("address2Line"), "address2 line");
    }

    #[test]
    fn test_fuzzy_components() {
        assert_eq!(ratio("abc", "abc"), 1.0);
        assert!((ratio("email", "emails") - 10.0 / 11.0).abs() < 1e-9);
        assert_eq!(partial_ratio("name", "first name"), 1.0);
        assert_eq!(token_sort_ratio("name first", "first name"), 1.0);
        assert_eq!(partial_ratio("", "x"), 0.0);
    }

    #[test]
    fn test_rule_score() {
        assert_eq!(rule_score("email", "email"), 1.0);
        assert_eq!(rule_score("applicant first name", "first name"), 0.9);
        assert_eq!(rule_score("phone num", "phone number"), 0.7);
        assert!((rule_score("home city", "city town") - 0.9).abs() < 1e-9);
        assert_eq!(rule_score("color", "weight"), 0.0);
    }

    #[test]
    fn test_maps_applicant_fields() {
        let extracted = vec![
            doc_field("applicant_first_name", "John", "name"),
            doc_field("applicant_last_name", "Doe", "name"),
            doc_field("email_addr", "john.doe@example.com", "email"),
            doc_field("phone_num", "555-123-4567", "phone"),
            doc_field("street_address", "123 Main St", "address"),
        ];
        let form = vec![
            form_field("firstName", "name"),
            form_field("lastName", "name"),
            form_field("emailAddress", "email"),
            form_field("phoneNumber", "phone"),
            form_field("homeAddress", "address"),
            form_field("dateOfBirth", "date"),
        ];

        let mappings = FieldMapper::default().map(&extracted, &form);
        let pairs: HashMap<&str, &str> = mappings
            .iter()
            .map(|m| (m.target_field.as_str(), m.source_field.as_str()))
            .collect();

        assert_eq!(mappings.len(), 5);
        assert_eq!(pairs["firstName"], "applicant_first_name");
        assert_eq!(pairs["lastName"], "applicant_last_name");
        assert_eq!(pairs["emailAddress"], "email_addr");
        assert_eq!(pairs["phoneNumber"], "phone_num");
        assert_eq!(pairs["homeAddress"], "street_address");
        assert!(!pairs.contains_key("dateOfBirth"));
        assert!(mappings.iter().all(|m| m.valid && m.confidence >= 0.7));
    }

    #[test]
    fn test_conflict_keeps_highest_confidence() {
        let extracted = vec![
            doc_field("email", "a@b.co", "email"),
            doc_field("email_address", "c@d.co", "email"),
        ];
        let form = vec![form_field("email", "email")];

        let mappings = FieldMapper::default().map(&extracted, &form);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].source_field, "email");
        assert_eq!(mappings[0].strategy, MatchStrategy::Exact);
        assert_eq!(mappings[0].confidence, 1.0);
    }

    #[test]
    fn test_value_validation() {
        assert!(validate_value(FieldType::Email, &json!("ada@example.com")));
        assert!(!validate_value(FieldType::Email, &json!("ada@")));
        assert!(validate_value(FieldType::Phone, &json!("+971 50 123 4567")));
        assert!(!validate_value(FieldType::Phone, &json!("12345")));
        assert!(validate_value(FieldType::Date, &json!("12/03/1990")));
        assert!(validate_value(FieldType::Date, &json!("1990-03-12")));
        assert!(validate_value(FieldType::Date, &json!("12 Mar 1990")));
        assert!(validate_value(FieldType::Number, &json!("1,234.5")));
        assert!(validate_value(FieldType::Number, &json!(42)));
        assert!(validate_value(FieldType::Currency, &json!("$1,234.56")));
        assert!(!validate_value(FieldType::Currency, &json!("12 dollars")));
        assert!(validate_value(FieldType::Text, &json!("anything")));
    }
}
