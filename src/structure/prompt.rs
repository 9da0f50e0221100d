use std::sync::LazyLock;

use super::normalize::{LOOKUP_FIELDS, NUMBER_FIELDS, SET_FIELDS};
use crate::db::Posting;

pub const SYSTEM: &str =
    "You are a precise job posting data extractor. Follow the schema and rules exactly as provided.";

/// Field list handed to the model; built from the persistence tables.
static SCHEMA: LazyLock<String> = LazyLock::new(|| {
    let mut s = String::from("Return one JSON object with these keys (use null when unknown):\n");
    for f in LOOKUP_FIELDS {
        s.push_str(&format!("- \"{}\": string or null\n", f.key));
    }
    for key in NUMBER_FIELDS {
        s.push_str(&format!("- \"{}\": number or null\n", key));
    }
    s.push_str("- \"original_language\": ISO 639-1 code of the posting's language, or null\n");
    s.push_str("- \"posting_date\": \"YYYY-MM-DD\" or null\n");
    for f in SET_FIELDS {
        s.push_str(&format!("- \"{}\": array of short strings\n", f.key));
    }
    s.push_str("- \"responsibilities\": array of strings, in the order they appear\n");
    s.push_str("- \"languages\": array of required language names\n");
    s.push_str("- \"language_proficiency\": object mapping each language to its level\n");
    s.push_str("- \"contact_emails\": array of strings\n");
    s.push_str("- \"contact_phones\": array of strings\n");
    s
});

const OUTPUT_RULES: &str = "CRITICAL OUTPUT RULES:
1. Return ONLY the JSON object
2. No markdown (no ```json or ```)
3. No explanations before or after
4. Start immediately with {
5. End immediately with }
6. Ensure all string values use double quotes
Begin JSON:";

/// First `max_chars` characters of `text`, and whether anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (&text[..idx], true),
        None => (text, false),
    }
}

pub fn user_message(posting: &Posting, max_chars: usize) -> String {
    let description = posting.description.as_deref().unwrap_or_default();
    let (body, truncated) = truncate_chars(description, max_chars);

    let mut msg = format!(
        "Extract information from this job posting:\nPOSTING DETAILS:\nTitle: {}\nCompany: {}\nSource URL: {}\n",
        posting.title, posting.company_name, posting.url
    );
    if truncated {
        msg.push_str(&format!("JOB DESCRIPTION (first {} characters):\n", max_chars));
    } else {
        msg.push_str("JOB DESCRIPTION:\n");
    }
    msg.push_str(body);
    if truncated {
        msg.push_str("\n... [description truncated]");
    }
    msg.push_str("\n---\n");
    msg.push_str(&SCHEMA);
    msg.push_str(OUTPUT_RULES);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posting(description: &str) -> Posting {
        Posting {
            id: 1,
            site: "s".into(),
            company_name: "Acme".into(),
            title: "Dev".into(),
            url: "https://s/1".into(),
            description: Some(description.into()),
        }
    }

    #[test]
    fn truncation_counts_chars() {
        assert_eq!(truncate_chars("zażółć", 3), ("zaż", true));
        assert_eq!(truncate_chars("abc", 3), ("abc", false));
        assert_eq!(truncate_chars("", 0), ("", false));
    }

    #[test]
    fn short_description_is_whole() {
        let msg = user_message(&posting("Build things."), 100);
        assert!(msg.contains("Title: Dev\nCompany: Acme\nSource URL: https://s/1"));
        assert!(msg.contains("JOB DESCRIPTION:\nBuild things.\n---"));
        assert!(!msg.contains("truncated"));
        assert!(msg.ends_with("Begin JSON:"));
    }

    #[test]
    fn long_description_is_marked() {
        let msg = user_message(&posting(&"x".repeat(50)), 10);
        assert!(msg.contains("(first 10 characters)"));
        assert!(msg.contains(&format!("{}\n... [description truncated]", "x".repeat(10))));
        assert!(!msg.contains(&"x".repeat(11)));
    }

    #[test]
    fn schema_lists_every_key() {
        for f in LOOKUP_FIELDS {
            assert!(SCHEMA.contains(&format!("\"{}\"", f.key)));
        }
        for f in SET_FIELDS {
            assert!(SCHEMA.contains(&format!("\"{}\"", f.key)));
        }
    }
}
