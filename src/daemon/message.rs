//! Protocol messages exchanged between the CLI and the build daemon.
//!
//! Every message starts with a single discriminator byte on the wire so that
//! routing decisions (most importantly cancellation) can be made without
//! decoding the payload. The payload layout per variant is defined by the
//! codec in [`crate::daemon::codec`].

/// Discriminator byte values. Stable wire contract; never renumber.
pub const BUILD_REQUEST: u8 = 0x01;
pub const BUILD_STARTED: u8 = 0x02;
pub const PROJECT_EVENT: u8 = 0x03;
pub const LOG_LINE: u8 = 0x04;
pub const PROMPT: u8 = 0x05;
pub const PROMPT_RESPONSE: u8 = 0x06;
pub const KEEP_ALIVE: u8 = 0x07;
pub const CANCEL_BUILD: u8 = 0x08;
pub const BUILD_FINISHED: u8 = 0x09;

/// A build the client asks the daemon to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Full command line to run, program first.
    pub args: Vec<String>,
    /// Directory the build runs in.
    pub working_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    BuildRequest(BuildRequest),
    /// The daemon accepted the request and started the build worker.
    BuildStarted {
        pid: u32,
    },
    /// Lifecycle event for one project within the build.
    ProjectEvent {
        project_id: String,
        message: String,
    },
    /// One line of build output.
    LogLine(String),
    /// The daemon needs input from the user to continue.
    Prompt {
        prompt_id: String,
        question: String,
    },
    PromptResponse {
        prompt_id: String,
        answer: String,
    },
    /// Periodic liveness signal from the daemon while it is otherwise quiet.
    KeepAlive,
    /// Abort the running build. Single byte on the wire, no payload.
    CancelBuild,
    /// Terminal message of a build; carries the worker's exit code.
    BuildFinished {
        exit_code: i32,
    },
}

impl Message {
    /// The wire discriminator for this message.
    pub fn discriminator(&self) -> u8 {
        match self {
            Message::BuildRequest(_) => BUILD_REQUEST,
            Message::BuildStarted { .. } => BUILD_STARTED,
            Message::ProjectEvent { .. } => PROJECT_EVENT,
            Message::LogLine(_) => LOG_LINE,
            Message::Prompt { .. } => PROMPT,
            Message::PromptResponse { .. } => PROMPT_RESPONSE,
            Message::KeepAlive => KEEP_ALIVE,
            Message::CancelBuild => CANCEL_BUILD,
            Message::BuildFinished { .. } => BUILD_FINISHED,
        }
    }

    pub fn is_cancel(&self) -> bool {
        self.discriminator() == CANCEL_BUILD
    }
}
