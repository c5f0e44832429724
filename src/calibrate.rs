use std::io::{self, BufRead, Write};

use energy_insight::OperatorInput;

/// Operator answers read from the terminal.
pub struct StdinOperator {
    stdin: io::Stdin,
}

impl StdinOperator {
    pub fn new() -> Self {
        Self { stdin: io::stdin() }
    }
}

impl OperatorInput for StdinOperator {
    fn prompt(&mut self, message: &str) -> Option<String> {
        print!("\n{}", message);
        if let Err(e) = io::stdout().flush() {
            log::warn!("Unable to flush prompt: {}", e);
        }

        let mut line = String::new();
        match self.stdin.lock().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(e) => {
                log::error!("Reading operator input failed: {}", e);
                None
            }
        }
    }

    fn notify(&mut self, message: &str) {
        println!("\n{}", message);
    }
}
