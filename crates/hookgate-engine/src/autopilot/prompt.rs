//! Continuation prompt construction

use hookgate_core::config::CompletionMode;

use super::loop_state::AutopilotLoopState;

/// Build the prompt injected when the session goes idle mid-loop
///
/// `state.iteration` is the iteration about to start.
pub fn build_continuation_prompt(state: &AutopilotLoopState) -> String {
    let mut prompt = String::new();

    prompt.push_str("[AUTOPILOT - ITERATION ");
    prompt.push_str(&state.iteration.to_string());
    if state.max_iterations > 0 {
        prompt.push('/');
        prompt.push_str(&state.max_iterations.to_string());
    }
    prompt.push_str("]\n\n");

    prompt.push_str("Your previous turn ended before the task was complete. ");
    prompt.push_str("Continue working on it; do not restart from scratch.\n\n");

    if !state.prompt.trim().is_empty() {
        prompt.push_str("## ORIGINAL TASK\n\n");
        prompt.push_str(state.prompt.trim());
        prompt.push_str("\n\n");
    }

    prompt.push_str("## COMPLETION SIGNAL\n\n");
    match state.completion_mode {
        CompletionMode::Promise => {
            prompt.push_str("When the task is fully complete, output exactly:\n\n");
            prompt.push_str("<promise>");
            prompt.push_str(&state.completion_promise);
            prompt.push_str("</promise>\n\n");
        }
        CompletionMode::Objective => {
            prompt.push_str("When the objective is fully met, output exactly:\n\n");
            prompt.push_str("<objective-complete>true</objective-complete>\n\n");
        }
    }
    prompt.push_str("Only signal completion when every open todo is finished.\n");

    prompt
}
