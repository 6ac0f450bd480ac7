//! Command-line application callbacks

use driver::Application;
use tracing::{error, info};

/// Logs driver milestones and prints serial responses to stdout
#[derive(Debug, Default)]
pub struct ConsoleApplication {
    /// Ask for de-initialization as soon as the device is ready
    exit_when_ready: bool,
    ready_ticks: u64,
}

impl ConsoleApplication {
    pub fn new(exit_when_ready: bool) -> Self {
        Self {
            exit_when_ready,
            ..Self::default()
        }
    }
}

impl Application for ConsoleApplication {
    fn device_not_supported(&mut self) {
        error!("Device not supported");
    }

    fn user_application(&mut self) -> u8 {
        if self.ready_ticks == 0 {
            info!("Device ready for use");
        }
        self.ready_ticks += 1;
        u8::from(self.exit_when_ready)
    }

    fn serial_response(&mut self, text: &str) {
        let text = text.trim_end();
        if !text.is_empty() {
            println!("{}", text);
        }
    }
}
