//! Prompt construction and answer normalization.

const CONTEXT_SEPARATOR: &str = "\n---\n";

/// Build the generation prompt. The model may only answer from `context`
/// and must reply with exactly `sentinel` otherwise.
pub fn build_prompt<S: AsRef<str>>(context: &[S], question: &str, sentinel: &str) -> String {
    let context = context
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR);
    format!(
        "You are a helpful customer-service assistant for a business.\n\
         Use ONLY the context below to answer the user.\n\
         Reply in the same language as the user's question.\n\
         If the answer is not in the context, return exactly \"{sentinel}\".\n\
         \n\
         CONTEXT:\n\
         {context}\n\
         \n\
         USER QUESTION:\n\
         {question}\n"
    )
}

/// Trim the model output. `None` when it carries the sentinel or is shorter
/// than `min_chars`.
pub fn normalize_answer(raw: &str, sentinel: &str, min_chars: usize) -> Option<String> {
    let answer = raw.trim();
    if (!sentinel.is_empty() && answer.contains(sentinel)) || answer.chars().count() < min_chars {
        return None;
    }
    Some(answer.to_string())
}
