// Template Substitution - Renders `{{field_name}}` placeholders from an entity snapshot
//
// Single pass, no expressions. Unknown placeholders stay in the output verbatim.

use dealflow_shared::{EntitySnapshot, EntityType, coerce_decimal};
use regex::{Captures, Regex};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("placeholder pattern is valid")
});

/// Substitute every resolvable placeholder in `template`.
///
/// A placeholder resolves against the snapshot field of the same name, or,
/// when prefixed with the entity type (`{{deal_name}}`, `{{deal.name}}`),
/// against the unprefixed field.
pub fn substitute(template: &str, snapshot: &EntitySnapshot, entity_type: EntityType) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }

    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        rendered.push_str(&template[last..whole.start()]);
        last = whole.end();

        let Some((field, value)) = lookup(&caps[1], snapshot, entity_type) else {
            rendered.push_str(whole.as_str());
            continue;
        };

        if opens_placeholder(&rendered) {
            rendered.push(BREAK);
        }
        rendered.push_str(&neutralize(&render_value(field, value, snapshot)));
    }
    rendered.push_str(&template[last..]);
    rendered
}

/// Placeholder names in `template` that the snapshot cannot resolve.
pub fn unresolved_placeholders(
    template: &str,
    snapshot: &EntitySnapshot,
    entity_type: EntityType,
) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .filter(|caps| lookup(&caps[1], snapshot, entity_type).is_none())
        .map(|caps| caps[1].to_string())
        .collect()
}

fn lookup<'a>(
    key: &'a str,
    snapshot: &'a EntitySnapshot,
    entity_type: EntityType,
) -> Option<(&'a str, &'a Value)> {
    if let Some(value) = snapshot.get(key) {
        return Some((key, value));
    }

    let prefix = entity_type.placeholder_prefix();
    let field = key
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_').or_else(|| rest.strip_prefix('.')))?;
    snapshot.get(field).map(|value| (field, value))
}

fn render_value(field: &str, value: &Value, snapshot: &EntitySnapshot) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if is_identifier_field(field) {
                return n.to_string();
            }
            match coerce_decimal(value) {
                Some(amount) if is_currency_field(field) => {
                    format_currency(amount, snapshot.get_str("currency"))
                }
                Some(number) => format_number(number),
                None => n.to_string(),
            }
        }
        other => other.to_string(),
    }
}

/// Zero-width space; never part of a placeholder, invisible when rendered.
const BREAK: char = '\u{200B}';

/// True when `rendered` ends in a brace that, with only name characters or
/// whitespace between, would open a placeholder continuing into the next value.
fn opens_placeholder(rendered: &str) -> bool {
    rendered
        .trim_end_matches(|c: char| {
            c.is_ascii_alphanumeric() || c == '_' || c == '.' || c.is_whitespace()
        })
        .ends_with('{')
}

/// Inserted values must not introduce new placeholders, or a second pass
/// would change the output. Every brace in the value is kept apart from its
/// neighbours.
fn neutralize(value: &str) -> String {
    if !value.contains(['{', '}']) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '{' => {
                out.push('{');
                out.push(BREAK);
            }
            '}' => {
                out.push(BREAK);
                out.push('}');
            }
            other => out.push(other),
        }
    }
    out
}

fn is_identifier_field(field: &str) -> bool {
    let leaf = field.rsplit('.').next().unwrap_or(field);
    leaf == "id" || leaf.ends_with("_id")
}

fn is_currency_field(field: &str) -> bool {
    let leaf = field.rsplit('.').next().unwrap_or(field);
    leaf == "amount" || leaf.ends_with("_amount") || leaf == "estimated_value" || leaf == "value"
}

/// Locale-neutral: comma thousands separators, `.` decimal point, trailing
/// fractional zeros dropped.
pub fn format_number(number: Decimal) -> String {
    let normalized = number.normalize();
    group_thousands(&normalized.to_string())
}

/// Two fixed decimals, optionally followed by the ISO currency code.
pub fn format_currency(amount: Decimal, currency: Option<&str>) -> String {
    let rounded = amount.round_dp(2);
    let grouped = group_thousands(&format!("{:.2}", rounded));
    match currency.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => format!("{} {}", grouped, code.to_ascii_uppercase()),
        None => grouped,
    }
}

fn group_thousands(plain: &str) -> String {
    let (sign, unsigned) = match plain.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", plain),
    };
    let (integer, fraction) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };

    let mut grouped = String::with_capacity(integer.len() + integer.len() / 3);
    for (index, digit) in integer.chars().enumerate() {
        if index > 0 && (integer.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    match fraction {
        Some(f) => format!("{}{}.{}", sign, grouped, f),
        None => format!("{}{}", sign, grouped),
    }
}
