// Botgate Engine — System Prompt Rendering
// A bot profile is a structured prompt bundle; this module flattens it into
// the system-prompt text every turn sends to the model. Sections are
// emitted only when the profile actually fills them.

use crate::atoms::types::{BotProfile, CommunicationStyle};

fn style_line(style: CommunicationStyle) -> &'static str {
    match style {
        CommunicationStyle::Formal => "Communicate in a formal, precise tone.",
        CommunicationStyle::Friendly => "Communicate in a warm, friendly tone.",
        CommunicationStyle::Humorous => "Communicate with light humor where appropriate.",
        CommunicationStyle::Professional => "Communicate in a professional, businesslike tone.",
        CommunicationStyle::Custom => "Follow the custom style rules given below.",
    }
}

/// Render the full system prompt for a profile.
pub fn render_system_prompt(profile: &BotProfile) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(format!("## Identity\n{}", profile.identity.trim()));

    if let Some(description) = &profile.description {
        if !description.trim().is_empty() {
            sections.push(format!("## About\n{}", description.trim()));
        }
    }

    let mut style = vec![style_line(profile.communication_style).to_string()];
    if let Some(lang) = &profile.primary_language {
        style.push(format!("Respond primarily in {}.", lang));
    }
    if let Some(lang) = &profile.secondary_language {
        style.push(format!("Fall back to {} when the user does.", lang));
    }
    style.extend(profile.language_rules.iter().cloned());
    sections.push(format!("## Style\n{}", style.join("\n")));

    if !profile.knowledge_base.is_empty() {
        let items: Vec<String> = profile
            .knowledge_base
            .iter()
            .map(|k| format!("### {}\n{}", k.topic, k.content))
            .collect();
        sections.push(format!("## Knowledge Base\n{}", items.join("\n\n")));
    }

    if !profile.initial_interactions.is_empty() {
        sections.push(format!(
            "## Opening the Conversation\n{}",
            bullet_list(&profile.initial_interactions)
        ));
    }

    if !profile.interaction_guidelines.is_empty() {
        sections.push(format!(
            "## Interaction Guidelines\n{}",
            bullet_list(&profile.interaction_guidelines)
        ));
    }

    if !profile.example_responses.is_empty() {
        let items: Vec<String> = profile
            .example_responses
            .iter()
            .map(|e| format!("- When: {}\n  Respond like: {}", e.scenario, e.response))
            .collect();
        sections.push(format!("## Example Responses\n{}", items.join("\n")));
    }

    if !profile.edge_cases.is_empty() {
        let items: Vec<String> = profile
            .edge_cases
            .iter()
            .map(|e| format!("- If {}: {}", e.case, e.action))
            .collect();
        sections.push(format!("## Edge Cases\n{}", items.join("\n")));
    }

    if let Some(tool_config) = &profile.tool_config {
        let mut lines = vec![format!("{}: {}", tool_config.name, tool_config.description)];
        for purpose in &tool_config.purposes {
            lines.push(format!("- {}", purpose));
        }
        sections.push(format!("## Tools\n{}", lines.join("\n")));
    }

    if let Some(privacy) = &profile.privacy_guidelines {
        if !privacy.trim().is_empty() {
            sections.push(format!("## Privacy\n{}", privacy.trim()));
        }
    }

    sections.join("\n\n")
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{EdgeCase, KnowledgeItem};
    use chrono::Utc;

    fn minimal_profile() -> BotProfile {
        BotProfile {
            id: "p1".into(),
            user_id: "u1".into(),
            name: "Support".into(),
            identity: "You are the support assistant for Acme.".into(),
            description: None,
            communication_style: CommunicationStyle::Professional,
            primary_language: None,
            secondary_language: None,
            language_rules: vec![],
            knowledge_base: vec![],
            tags: vec![],
            initial_interactions: vec![],
            interaction_guidelines: vec![],
            example_responses: vec![],
            edge_cases: vec![],
            tool_config: None,
            privacy_guidelines: None,
            tool_servers: vec![],
            is_enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn minimal_profile_renders_identity_and_style_only() {
        let text = render_system_prompt(&minimal_profile());
        assert!(text.starts_with("## Identity"));
        assert!(text.contains("support assistant for Acme"));
        assert!(text.contains("professional, businesslike"));
        assert!(!text.contains("## Knowledge Base"));
        assert!(!text.contains("## Edge Cases"));
    }

    #[test]
    fn filled_sections_appear_in_order() {
        let mut profile = minimal_profile();
        profile.primary_language = Some("Hebrew".into());
        profile.knowledge_base.push(KnowledgeItem {
            topic: "Returns".into(),
            content: "30-day return window.".into(),
        });
        profile.edge_cases.push(EdgeCase {
            case: "the user asks for a refund".into(),
            action: "hand off to a human agent".into(),
        });

        let text = render_system_prompt(&profile);
        assert!(text.contains("Respond primarily in Hebrew."));
        assert!(text.contains("### Returns"));
        assert!(text.contains("- If the user asks for a refund: hand off to a human agent"));

        let kb = text.find("## Knowledge Base").unwrap();
        let edge = text.find("## Edge Cases").unwrap();
        assert!(kb < edge);
    }
}
