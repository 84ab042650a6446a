//! Translation of the isolation predicate into a parameterized `WHERE` fragment.

use access_kernel_core::{ContextSensitivity, Predicate};
use rusqlite::types::Value;

/// A boolean SQL fragment over the `contexts` table and its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SqlFilter {
    pub(crate) clause: String,
    pub(crate) params: Vec<Value>,
}

pub(crate) fn to_sql(predicate: &Predicate) -> SqlFilter {
    let mut params = Vec::new();
    let clause = render(predicate, &mut params);
    SqlFilter { clause, params }
}

fn render(predicate: &Predicate, params: &mut Vec<Value>) -> String {
    match predicate {
        Predicate::All => "1 = 1".to_string(),
        Predicate::Nothing => "1 = 0".to_string(),
        Predicate::Eq(field, value) => {
            params.push(Value::Text(value.clone()));
            format!("{} = ?", field.column())
        }
        Predicate::In(field, values) => {
            if values.is_empty() {
                return "1 = 0".to_string();
            }
            params.extend(values.iter().cloned().map(Value::Text));
            format!("{} IN ({})", field.column(), placeholders(values.len()))
        }
        Predicate::TierAtMost(ceiling) => {
            let tiers = ContextSensitivity::ALL
                .into_iter()
                .filter(|tier| tier <= ceiling)
                .collect::<Vec<_>>();
            params.extend(tiers.iter().map(|tier| Value::Text(tier.as_str().to_string())));
            format!("sensitivity_tier IN ({})", placeholders(tiers.len()))
        }
        Predicate::And(parts) => join(parts, " AND ", "1 = 1", params),
        Predicate::Or(parts) => join(parts, " OR ", "1 = 0", params),
        // Comparisons against a NULL owner column are NULL; negate them as false.
        Predicate::Not(inner) => format!("NOT COALESCE({}, 0)", render(inner, params)),
    }
}

fn join(parts: &[Predicate], separator: &str, empty: &str, params: &mut Vec<Value>) -> String {
    if parts.is_empty() {
        return empty.to_string();
    }
    let rendered = parts.iter().map(|part| render(part, params)).collect::<Vec<_>>();
    format!("({})", rendered.join(separator))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
