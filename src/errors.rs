//! Exit-code classification from 6.5, surfaced through
//! [`crate::supervisor::SupervisorError::ExitedBeforeReady`].

/// Classifies an adapter-process exit code per 6.5: `0` reads as a
/// normal exit (the debuggee likely finished before any breakpoint was
/// hit), anything else as a crash, with known termination signals
/// called out by name in the message.
pub fn describe_exit_code(code: Option<i32>) -> String {
    match code {
        None => "adapter process state unknown (no exit code observed)".to_string(),
        Some(0) => "adapter exited normally (code 0); the debuggee likely ran to completion before any breakpoint was hit".to_string(),
        Some(137) => "adapter was killed (exit code 137, consistent with SIGKILL)".to_string(),
        Some(143) => "adapter terminated (exit code 143, consistent with SIGTERM)".to_string(),
        Some(code) => format!("adapter exited with a nonzero code ({code}), indicating a crash"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_reads_as_normal_completion() {
        assert!(describe_exit_code(Some(0)).contains("normally"));
    }

    #[test]
    fn signal_exit_codes_are_named() {
        assert!(describe_exit_code(Some(137)).contains("SIGKILL"));
        assert!(describe_exit_code(Some(143)).contains("SIGTERM"));
    }

    #[test]
    fn other_nonzero_codes_read_as_a_crash() {
        assert!(describe_exit_code(Some(1)).contains("crash"));
    }
}
