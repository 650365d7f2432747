//! Phase definitions and prompt construction.
//!
//! Phases are static: an ordered list of `PhaseSpec`s defines the pipeline.
//! The first phase receives the seed prompt; every later phase receives its
//! own template with the previous phase's text substituted in.

use std::path::Path;

/// Placeholder replaced by the previous phase's text.
pub const PREVIOUS_PLACEHOLDER: &str = "{previous}";

/// One bounded, tool-augmented generation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpec {
    pub name: String,
    pub system_prompt: String,
    /// User prompt for phases after the first. Contains
    /// [`PREVIOUS_PLACEHOLDER`]; if it does not, the previous text is
    /// appended.
    pub prompt_template: String,
    /// Marker that ends the phase when it appears in model output.
    pub stop_sequence: String,
    /// Maximum number of model turns.
    pub max_steps: u32,
}

impl PhaseSpec {
    pub fn new(
        name: &str,
        system_prompt: &str,
        prompt_template: &str,
        stop_sequence: &str,
        max_steps: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            system_prompt: system_prompt.to_string(),
            prompt_template: prompt_template.to_string(),
            stop_sequence: stop_sequence.to_string(),
            max_steps,
        }
    }

    /// The prompt for this phase given the previous phase's text.
    pub fn render_prompt(&self, previous: &str) -> String {
        if self.prompt_template.contains(PREVIOUS_PLACEHOLDER) {
            self.prompt_template.replace(PREVIOUS_PLACEHOLDER, previous)
        } else {
            format!("{}\n\n{previous}", self.prompt_template.trim_end())
        }
    }

    /// System prompt plus the stop-marker instruction.
    pub fn system_message(&self) -> String {
        format!(
            "{}\n\nWhen this phase is complete, end your final message with the exact \
             marker {}. Do not write the marker before the work is done.",
            self.system_prompt.trim_end(),
            self.stop_sequence
        )
    }

    /// Sent after a turn with neither tool calls nor the stop marker.
    pub fn continuation_nudge(&self) -> String {
        format!(
            "Continue. Use the available tools if you need more information. \
             When this phase is complete, finish with {}.",
            self.stop_sequence
        )
    }
}

/// Prompt for the first phase.
pub fn seed_prompt(target_dir: &Path, context: Option<&str>) -> String {
    let mut prompt = format!(
        "Analyze the codebase at {} and extract its business rules: the \
         domain constraints, validations, calculations, state transitions and \
         policies that the code enforces. Use the tools to explore the tree; \
         do not guess at file contents.",
        target_dir.display()
    );
    if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
        prompt.push_str("\n\nAdditional context from the project owners:\n");
        prompt.push_str(context);
    }
    prompt
}

/// The default discover → extract → consolidate sequence.
pub fn default_phases() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec::new(
            "discover",
            "You are mapping an unfamiliar codebase. List directories and search \
             for files to find where business logic lives: domain models, \
             services, validators, pricing or billing code, workflows. Skip \
             vendored code, generated files, tests and build output. Report a \
             prioritized list of files and modules worth reading, with one line \
             on why each matters.",
            PREVIOUS_PLACEHOLDER,
            "<<DISCOVERY_COMPLETE>>",
            25,
        ),
        PhaseSpec::new(
            "extract",
            "You are extracting business rules from source code. Read the files \
             identified during discovery. For every rule you find, state the rule \
             in plain language, the file and function that enforces it, and any \
             constants or thresholds involved. Only report rules you have seen in \
             code you actually read.",
            "Files and modules identified during discovery:\n\n{previous}\n\n\
             Read these files and extract every business rule they enforce.",
            "<<EXTRACTION_COMPLETE>>",
            40,
        ),
        PhaseSpec::new(
            "consolidate",
            "You are editing a business-rules catalogue. Merge duplicates, group \
             rules by domain area, and resolve contradictions by re-reading the \
             relevant code when needed. Produce the final document: one section \
             per domain area, each rule with a short title, a description and its \
             source references.",
            "Candidate rules extracted from the code:\n\n{previous}\n\n\
             Consolidate these into the final business-rules document.",
            "<<RULES_COMPLETE>>",
            10,
        ),
    ]
}

/// Replace every phase's step budget when `max_steps` is set.
pub fn with_step_override(mut phases: Vec<PhaseSpec>, max_steps: Option<u32>) -> Vec<PhaseSpec> {
    if let Some(max_steps) = max_steps {
        for phase in &mut phases {
            phase.max_steps = max_steps;
        }
    }
    phases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_placeholder() {
        let phase = PhaseSpec::new("p", "sys", "Before {previous} after", "<<END>>", 3);
        assert_eq!(phase.render_prompt("MIDDLE"), "Before MIDDLE after");
    }

    #[test]
    fn test_render_appends_without_placeholder() {
        let phase = PhaseSpec::new("p", "sys", "Summarize this:\n", "<<END>>", 3);
        assert_eq!(phase.render_prompt("the text"), "Summarize this:\n\nthe text");
    }

    #[test]
    fn test_system_message_names_marker() {
        let phase = PhaseSpec::new("p", "Be precise.", "{previous}", "<<END>>", 3);
        let system = phase.system_message();
        assert!(system.starts_with("Be precise."));
        assert!(system.contains("<<END>>"));
        assert!(phase.continuation_nudge().contains("<<END>>"));
    }

    #[test]
    fn test_seed_prompt_includes_dir_and_context() {
        let seed = seed_prompt(Path::new("/srv/shop"), Some("  Orders ship within 2 days.  "));
        assert!(seed.contains("/srv/shop"));
        assert!(seed.ends_with("Orders ship within 2 days."));

        let bare = seed_prompt(Path::new("/srv/shop"), Some("   "));
        assert!(!bare.contains("Additional context"));
    }

    #[test]
    fn test_default_phases_shape() {
        let phases = default_phases();
        let names: Vec<&str> = phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["discover", "extract", "consolidate"]);
        let budgets: Vec<u32> = phases.iter().map(|p| p.max_steps).collect();
        assert_eq!(budgets, vec![25, 40, 10]);
        assert!(phases[1..]
            .iter()
            .all(|p| p.prompt_template.contains(PREVIOUS_PLACEHOLDER)));
    }

    #[test]
    fn test_step_override_replaces_all_budgets() {
        let phases = with_step_override(default_phases(), Some(7));
        assert!(phases.iter().all(|p| p.max_steps == 7));

        let untouched = with_step_override(default_phases(), None);
        assert_eq!(untouched, default_phases());
    }
}
