//! Persona text and the user-preferences section of the system prompt.

/// Placeholder replaced with the user's display name.
pub const USER_PLACEHOLDER: &str = "{{user}}";

const PREFERENCES_HEADING: &str = "## User profile & preferences";

const PREFERENCES_GUIDANCE: &str = "Use these details naturally: refer to the user's interests, \
remember what they told you about themselves, and match their tone.";

/// The fixed character text, with per-user name substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    template: String,
    default_name: String,
}

impl Persona {
    pub fn new(template: impl Into<String>, default_name: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            default_name: default_name.into(),
        }
    }

    /// Persona text for one user. Blank names use the default.
    pub fn render(&self, display_name: Option<&str>) -> String {
        let name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.default_name);
        self.template.replace(USER_PLACEHOLDER, name)
    }
}

/// Join persona and preferences into the single system turn.
///
/// Blank preferences add nothing, so a user without a profile gets the bare
/// persona.
pub fn compose_system_prompt(persona: &str, preferences: &str) -> String {
    let preferences = preferences.trim();
    if preferences.is_empty() {
        return persona.to_string();
    }
    format!("{persona}\n\n{PREFERENCES_HEADING}\n{preferences}\n\n{PREFERENCES_GUIDANCE}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_every_placeholder() {
        let persona = Persona::new("Hi {{user}}! Nice to see you, {{user}}.", "friend");
        assert_eq!(persona.render(Some("Oleg")), "Hi Oleg! Nice to see you, Oleg.");
        assert_eq!(persona.render(Some("  ")), "Hi friend! Nice to see you, friend.");
        assert_eq!(persona.render(None), "Hi friend! Nice to see you, friend.");
    }

    #[test]
    fn blank_preferences_leave_persona_untouched() {
        assert_eq!(compose_system_prompt("You are Alice.", " \n"), "You are Alice.");
    }

    #[test]
    fn preferences_are_appended_verbatim() {
        let prompt = compose_system_prompt("You are Alice.", "  Loves anime; works nights. ");
        assert!(prompt.starts_with("You are Alice.\n\n## User profile & preferences\n"));
        assert!(prompt.contains("Loves anime; works nights."));
    }
}
