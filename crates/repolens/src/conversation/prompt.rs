//! Fixed prompt text: the instructions that open every prompt and the
//! framing around a file delivered on the model's request.

use super::file_request::REQUEST_FILE_ACTION;

const BASE_INSTRUCTIONS: &str = "\
You are a highly skilled programming and code analysis assistant. \
You are given context that includes:
1. The full file tree of the repository.
2. Code fragments (chunks), whole files or short summaries of files that were judged relevant.

Your task is to answer my questions about the code.

**CRITICAL RULE:**
If the provided context is not enough to answer, but you can see the needed file in the **file tree**, \
request its content. To do so, your reply must be ONLY a JSON object of exactly this form:
";

const AFTER_REQUEST_FORMAT: &str = "\
Do not add any other text, explanation or code fence around this JSON. \
I will process the request automatically, give you the file content, \
and you can then answer my original question.

If the information is sufficient, or you are not sure which file is needed, or the question is not \
about the code, answer normally based on the provided context. \
Always explain what you suggest changing and why. \
Suggest commit messages in the Conventional Commits style when appropriate.";

/// The exact reply that requests `path`.
pub fn file_request_json(path: &str) -> String {
    serde_json::json!({ "action": REQUEST_FILE_ACTION, "file_path": path }).to_string()
}

/// Build the instructions text: built-in rules, the user's own
/// instructions, and the response language.
pub fn system_instructions(user_instructions: &str, language: &str) -> String {
    let mut text = String::from(BASE_INSTRUCTIONS);
    text.push_str(&file_request_json("full/path/to/file.py"));
    text.push_str("\n\n");
    text.push_str(AFTER_REQUEST_FORMAT);

    let extra = user_instructions.trim();
    if !extra.is_empty() {
        text.push_str("\n\nAdditional user instructions:\n");
        text.push_str(extra);
    }

    let language = match language.trim() {
        "" => "English",
        l => l,
    };
    text.push_str(&format!(
        "\n\nPlease answer all questions in {language} unless asked otherwise."
    ));
    text
}

/// User side of the synthetic exchange added after a requested file was
/// injected.
pub fn file_attached(path: &str) -> String {
    format!(
        "The requested file `{path}` is now attached in the project context. \
         Please answer my original question using this new information."
    )
}

/// Model side of the same exchange.
pub fn file_attached_ack(path: &str) -> String {
    format!("OK. I will use `{path}` to answer.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::file_request::parse;

    #[test]
    fn instructions_contain_a_parseable_request_example() {
        let text = system_instructions("", "English");
        let example = file_request_json("full/path/to/file.py");
        assert!(text.contains(&example));
        assert_eq!(parse(&example).unwrap().file_path, "full/path/to/file.py");
    }

    #[test]
    fn user_instructions_and_language_are_appended() {
        let text = system_instructions("  Be brief.  ", "Russian");
        assert!(text.contains("Additional user instructions:\nBe brief."));
        assert!(text.ends_with("Please answer all questions in Russian unless asked otherwise."));
    }

    #[test]
    fn blank_language_defaults_to_english() {
        assert!(system_instructions("", " ").contains("in English"));
    }
}
