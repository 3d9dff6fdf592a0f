//! Clarification Generator - one smart question instead of many.
//!
//! When a default can fill the blank the question is a confirmation
//! ("أنشئ ملف notes.txt على سطح المكتب؟"); otherwise it is a single
//! targeted question. Always paired with quick-reply chips.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::command::Intent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clarification {
    pub question: String,
    pub suggestions: HashMap<String, String>,
    pub missing_fields: Vec<String>,
    pub quick_replies: Vec<String>,
    pub confidence: f64,
}

impl Clarification {
    /// A confirmation proposes a complete command; a question still needs
    /// information.
    pub fn is_confirmation(&self) -> bool {
        self.confidence >= 0.6
    }
}

struct IntentTemplate {
    confirmation: &'static str,
    question_target: &'static str,
    question_loc: &'static str,
    question_both: &'static str,
    default_target: &'static str,
    default_loc: &'static str,
}

fn template_for(intent: Intent) -> Option<IntentTemplate> {
    let t = match intent {
        Intent::CreateFolder => IntentTemplate {
            confirmation: "أنشئ مجلد \"{target}\" في {loc}؟",
            question_target: "شو اسم المجلد؟",
            question_loc: "وين أنشئ المجلد؟",
            question_both: "شو اسم المجلد ووين؟",
            default_target: "مجلد_جديد",
            default_loc: "desktop",
        },
        Intent::CreateFile => IntentTemplate {
            confirmation: "أنشئ ملف \"{target}\" في {loc}؟",
            question_target: "شو اسم الملف؟",
            question_loc: "وين أنشئ الملف؟",
            question_both: "شو اسم الملف ووين؟",
            default_target: "ملف_جديد.txt",
            default_loc: "desktop",
        },
        Intent::Delete => IntentTemplate {
            confirmation: "متأكد تحذف \"{target}\" من {loc}؟",
            question_target: "شو بدك تحذف؟",
            question_loc: "من وين أحذف؟",
            question_both: "شو أحذف ومن وين؟",
            default_target: "",
            default_loc: "desktop",
        },
        Intent::Watch => IntentTemplate {
            confirmation: "أراقب {loc}؟",
            question_target: "",
            question_loc: "أي مجلد أراقب؟",
            question_both: "أي مجلد أراقب؟",
            default_target: "",
            default_loc: "downloads",
        },
        Intent::Open => IntentTemplate {
            confirmation: "أفتح {target}؟",
            question_target: "شو بدك أفتح؟",
            question_loc: "",
            question_both: "شو بدك أفتح؟",
            default_target: "",
            default_loc: "",
        },
        _ => return None,
    };
    Some(t)
}

fn humanize_loc(loc: &str) -> &str {
    match loc {
        "desktop" => "سطح المكتب",
        "downloads" => "التنزيلات",
        "documents" => "المستندات",
        "pictures" => "الصور",
        other => other,
    }
}

pub struct ClarificationGenerator;

impl ClarificationGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Build one clarification for an intent with the given missing
    /// fields, merging suggestions from the world model with template
    /// defaults.
    pub fn generate(
        &self,
        intent: Intent,
        missing_fields: &[String],
        suggestions: &HashMap<String, String>,
    ) -> Clarification {
        // The confidence calculator says "location"; everywhere else the
        // field is "loc".
        let missing_fields: Vec<String> = missing_fields
            .iter()
            .map(|f| {
                if f == "location" {
                    "loc".to_string()
                } else {
                    f.clone()
                }
            })
            .collect();
        let missing_fields = missing_fields.as_slice();

        let template = template_for(intent);

        let mut filled = suggestions.clone();
        if let Some(t) = &template {
            for field in missing_fields {
                if filled.contains_key(field) {
                    continue;
                }
                let default = match field.as_str() {
                    "target" => t.default_target,
                    "loc" => t.default_loc,
                    _ => "",
                };
                if !default.is_empty() {
                    filled.insert(field.clone(), default.to_string());
                }
            }
        }

        let confidence = if missing_fields.is_empty() {
            1.0
        } else {
            let covered = missing_fields.iter().filter(|f| filled.contains_key(*f)).count();
            covered as f64 / missing_fields.len() as f64
        };

        let (question, quick_replies) = if confidence >= 0.6 {
            let question = template
                .as_ref()
                .map(|t| {
                    t.confirmation
                        .replace("{target}", filled.get("target").map(String::as_str).unwrap_or(""))
                        .replace(
                            "{loc}",
                            humanize_loc(filled.get("loc").map(String::as_str).unwrap_or("")),
                        )
                })
                .unwrap_or_else(|| format!("تنفيذ {}؟", intent.as_str()));
            (
                question,
                vec![
                    "نفّذ".to_string(),
                    "غير الاسم".to_string(),
                    "غير المكان".to_string(),
                    "لا".to_string(),
                ],
            )
        } else {
            let question = template
                .as_ref()
                .map(|t| {
                    if missing_fields.len() >= 2 && !t.question_both.is_empty() {
                        t.question_both
                    } else if missing_fields.iter().any(|f| f == "target")
                        && !t.question_target.is_empty()
                    {
                        t.question_target
                    } else if !t.question_loc.is_empty() {
                        t.question_loc
                    } else {
                        "ممكن توضحلي أكتر؟"
                    }
                })
                .unwrap_or("ممكن توضحلي أكتر؟")
                .to_string();
            (
                question,
                vec![
                    "سطح المكتب".to_string(),
                    "التنزيلات".to_string(),
                    "المستندات".to_string(),
                ],
            )
        };

        Clarification {
            question,
            suggestions: filled,
            missing_fields: missing_fields.to_vec(),
            quick_replies,
            confidence,
        }
    }

    /// Interpret the user's reply to a clarification.
    pub fn parse_response(&self, response: &str, clarification: &Clarification) -> UserReply {
        let lower = response.trim().to_lowercase();

        const CONFIRM: &[&str] = &["نفّذ", "نفذ", "تمام", "أي", "ماشي", "yes", "ok", "y"];
        const CANCEL: &[&str] = &["لا", "إلغاء", "الغاء", "وقف", "no", "cancel", "n"];

        if CONFIRM.contains(&lower.as_str()) {
            return UserReply::Confirm(clarification.suggestions.clone());
        }
        if CANCEL.contains(&lower.as_str()) {
            return UserReply::Cancel;
        }

        for (phrases, loc) in [
            (&["التنزيلات", "downloads"][..], "downloads"),
            (&["المستندات", "documents"][..], "documents"),
            (&["سطح المكتب", "المكتب", "desktop"][..], "desktop"),
        ] {
            if phrases.iter().any(|p| lower.contains(p)) {
                let mut update = HashMap::new();
                update.insert("loc".to_string(), loc.to_string());
                return UserReply::Update(update);
            }
        }

        // A short reply with no verb is most likely the missing name.
        let word_count = response.split_whitespace().count();
        let has_verb = ["انشئ", "أنشئ", "احذف", "افتح", "غير"]
            .iter()
            .any(|v| lower.contains(v));
        if word_count <= 2 && !has_verb && clarification.missing_fields.iter().any(|f| f == "target")
        {
            let mut update = HashMap::new();
            update.insert("target".to_string(), response.trim().to_string());
            return UserReply::Update(update);
        }

        UserReply::Unknown
    }
}

impl Default for ClarificationGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserReply {
    Confirm(HashMap<String, String>),
    Cancel,
    Update(HashMap<String, String>),
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_when_defaults_cover_blanks() {
        let gen = ClarificationGenerator::new();
        let clar = gen.generate(
            Intent::CreateFile,
            &["target".to_string(), "loc".to_string()],
            &HashMap::new(),
        );

        assert!(clar.is_confirmation());
        assert!(clar.question.contains("ملف_جديد.txt"));
        assert!(clar.question.contains("سطح المكتب"));
        assert!(clar.quick_replies.len() >= 3 && clar.quick_replies.len() <= 4);
    }

    #[test]
    fn test_question_when_no_default_exists() {
        let gen = ClarificationGenerator::new();
        let clar = gen.generate(Intent::Delete, &["target".to_string()], &HashMap::new());

        assert!(!clar.is_confirmation());
        assert_eq!(clar.question, "شو بدك تحذف؟");
    }

    #[test]
    fn test_parse_confirm_and_cancel() {
        let gen = ClarificationGenerator::new();
        let clar = gen.generate(
            Intent::CreateFolder,
            &["loc".to_string()],
            &HashMap::new(),
        );

        assert!(matches!(gen.parse_response("نفّذ", &clar), UserReply::Confirm(_)));
        assert_eq!(gen.parse_response("cancel", &clar), UserReply::Cancel);
    }

    #[test]
    fn test_parse_location_change() {
        let gen = ClarificationGenerator::new();
        let clar = gen.generate(
            Intent::CreateFolder,
            &["loc".to_string()],
            &HashMap::new(),
        );

        match gen.parse_response("في التنزيلات", &clar) {
            UserReply::Update(update) => assert_eq!(update["loc"], "downloads"),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_short_reply_fills_target() {
        let gen = ClarificationGenerator::new();
        let clar = gen.generate(Intent::Delete, &["target".to_string()], &HashMap::new());

        match gen.parse_response("report.pdf", &clar) {
            UserReply::Update(update) => assert_eq!(update["target"], "report.pdf"),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
