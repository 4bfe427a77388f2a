//! Prompt text sent along with generation requests.

/// System prompt for providers called directly. The relay backend adds its own.
pub const ARTIFACT_SYSTEM_PROMPT: &str = r#"You are an expert software engineer who builds complete, runnable projects.

Reply with a single artifact that contains every file of the project:

<artifact title="Short project title">
<action type="file" path="package.json">
...full file contents...
</action>
<action type="shell">
npm install
</action>
</artifact>

Rules:
- Always write complete files. Never elide code with placeholders.
- Paths are relative to the project root and use forward slashes.
- Include a package.json with a "dev" script that starts a development server.
- Put any explanation before the artifact, never inside it."#;

/// Guidance appended to every regeneration request.
pub const REGENERATION_GUIDANCE: &str = "IMPORTANT: Check for any missing imports (like 'Calendar', 'Lucide' icons, etc.) and ensure all used components are defined. Consider wrapping the application in an Error Boundary to prevent white screen crashes. Return the full updated code structure.";

/// Wrap an instruction as the final user message of a regeneration.
pub fn regeneration_message(instruction: &str) -> String {
    format!(
        "Here is the new request to update the project: {}. Please regenerate or update the code accordingly. {}",
        instruction, REGENERATION_GUIDANCE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regeneration_message_embeds_instruction_verbatim() {
        let instruction = "I encountered this error during execution: SyntaxError: x. Please fix it.";
        let message = regeneration_message(instruction);
        assert!(message.contains(instruction));
        assert!(message.ends_with(REGENERATION_GUIDANCE));
    }
}
