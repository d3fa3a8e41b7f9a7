use serde::{Deserialize, Serialize};

use crate::types::{EmploymentType, ExperienceLevel};

string_enum! {
    pub enum JobSort {
        Newest => "newest",
        Salary => "salary",
    }
}

impl Default for JobSort {
    fn default() -> Self {
        Self::Newest
    }
}

/// Filters accepted by the public job search. Every field is optional and
/// absent fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSearch {
    pub q: Option<String>,
    pub location: Option<String>,
    pub employment_type: Option<EmploymentType>,
    pub experience_level: Option<ExperienceLevel>,
    pub is_remote: Option<bool>,
    pub company_id: Option<String>,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    #[serde(default)]
    pub sort: JobSort,
}

impl JobSearch {
    /// Drops blank text filters so `?q=` behaves like no filter at all.
    pub fn normalized(mut self) -> Self {
        self.q = normalize_text(self.q);
        self.location = normalize_text(self.location);
        self.company_id = normalize_text(self.company_id);
        self
    }
}

fn normalize_text(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}

/// Escapes `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'`
/// pattern and wraps the value for substring matching.
pub fn like_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('%');
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}
