/// Placeholder a system-prompt template uses for retrieved context.
pub const CONTEXT_PLACEHOLDER: &str = "{rag_context}";

const KNOWLEDGE_BASE_PROMPT: &str = "You are a helpful assistant with access to a knowledge base. \
You have been provided with context from relevant documents to help answer user questions.

IMPORTANT INSTRUCTIONS:
1. Base your answers primarily on the provided context when relevant
2. If the context contains the exact information needed, cite it directly
3. If the context is partially relevant, use it as a foundation and clearly indicate when you're adding general knowledge
4. If the context is not relevant to the question, you may provide answers from your general knowledge
5. Be concise but comprehensive in your responses

RETRIEVED CONTEXT FROM KNOWLEDGE BASE:
";

/// Build the system prompt one provider receives.
///
/// * template and context: placeholder replaced by a labelled context block
///   (appended when the template has no placeholder)
/// * template only: placeholder removed
/// * context only: generic knowledge-base prompt followed by the context
/// * neither: no system prompt
pub fn compose_system_prompt(template: Option<&str>, context: Option<&str>) -> Option<String> {
    let template = template.map(str::trim).filter(|t| !t.is_empty());
    let context = context.map(str::trim).filter(|c| !c.is_empty());

    match (template, context) {
        (Some(template), Some(context)) => {
            let section = format!("\nRELEVANT CONTEXT FROM KNOWLEDGE BASE:\n{}\n", context);
            if template.contains(CONTEXT_PLACEHOLDER) {
                Some(template.replace(CONTEXT_PLACEHOLDER, &section))
            } else {
                Some(format!("{}\n{}", template, section))
            }
        }
        (Some(template), None) => Some(template.replace(CONTEXT_PLACEHOLDER, "").trim().to_string()),
        (None, Some(context)) => Some(format!("{}{}", KNOWLEDGE_BASE_PROMPT, context)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_with_context() {
        let prompt = compose_system_prompt(Some("Intro\n{rag_context}\nOutro"), Some("[Document 1] facts"))
            .unwrap();
        assert!(prompt.starts_with("Intro\n"));
        assert!(prompt.contains("RELEVANT CONTEXT FROM KNOWLEDGE BASE:\n[Document 1] facts"));
        assert!(prompt.ends_with("Outro"));
        assert!(!prompt.contains(CONTEXT_PLACEHOLDER));
    }

    #[test]
    fn test_template_without_placeholder_appends_context() {
        let prompt = compose_system_prompt(Some("Be terse."), Some("ctx")).unwrap();
        assert!(prompt.starts_with("Be terse."));
        assert!(prompt.contains("ctx"));
    }

    #[test]
    fn test_template_only_strips_placeholder() {
        let prompt = compose_system_prompt(Some("{rag_context}\n\nBe helpful."), None).unwrap();
        assert_eq!(prompt, "Be helpful.");
    }

    #[test]
    fn test_context_only_uses_knowledge_base_prompt() {
        let prompt = compose_system_prompt(None, Some("ctx")).unwrap();
        assert!(prompt.starts_with("You are a helpful assistant with access to a knowledge base."));
        assert!(prompt.ends_with("RETRIEVED CONTEXT FROM KNOWLEDGE BASE:\nctx"));
    }

    #[test]
    fn test_neither() {
        assert_eq!(compose_system_prompt(None, None), None);
        assert_eq!(compose_system_prompt(Some("  "), Some("")), None);
    }
}
