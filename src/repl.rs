use std::io::{self, BufRead, Write};

use crate::runtime::vm::Vm;

/// The interactive shell.
///
/// Lines accumulate in a buffer until one ends with `;`, then the whole
/// buffer runs in the persistent VM, so multi-line constructs work and
/// globals survive between inputs. Lines starting with `:` are shell
/// commands and never reach the interpreter.
pub struct Repl {
    vm: Vm,
    history: Vec<String>,
    buffer: String,
}

impl Default for Repl {
    fn default() -> Self {
        Repl::new()
    }
}

impl Repl {
    pub fn new() -> Self {
        Repl {
            vm: Vm::new(),
            history: Vec::new(),
            buffer: String::new(),
        }
    }

    pub fn run(&mut self) -> io::Result<()> {
        println!("TinyLang {}", env!("CARGO_PKG_VERSION"));
        println!("Type :help for shell commands, :quit to exit");

        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();

        loop {
            if self.buffer.is_empty() {
                print!("tl> ");
            } else {
                print!("  > ");
            }
            io::stdout().flush()?;

            let Some(line) = lines.next() else {
                break;
            };
            let line = line?;
            let trimmed = line.trim();

            if trimmed.is_empty() {
                continue;
            }

            self.history.push(line.clone());

            if self.buffer.is_empty() && trimmed.starts_with(':') {
                if !self.command(trimmed) {
                    break;
                }
                continue;
            }

            self.buffer.push_str(&line);
            self.buffer.push('\n');

            // Declarations end in '}', everything else in ';'.
            if trimmed.ends_with(';') || trimmed.ends_with('}') {
                let source = std::mem::take(&mut self.buffer);
                self.vm.interpret(&source);
            }
        }

        println!("Goodbye!");
        Ok(())
    }

    /// Handles a `:` command; returns false when the shell should exit.
    fn command(&mut self, command: &str) -> bool {
        match command {
            ":quit" | ":exit" => return false,
            ":help" => {
                println!(":quit, :exit   leave the shell");
                println!(":help          this text");
                println!(":history       inputs so far");
                println!(":gc            force a garbage collection");
                println!(":globals       defined globals, oldest first");
                println!(":stats         execution counters");
            }
            ":history" => {
                for (index, line) in self.history.iter().enumerate() {
                    println!("{:4}  {}", index + 1, line);
                }
            }
            ":gc" => {
                let before = self.vm.bytes_allocated();
                self.vm.collect_garbage();
                let after = self.vm.bytes_allocated();
                println!(
                    "collected {} bytes ({} -> {})",
                    before.saturating_sub(after),
                    before,
                    after
                );
            }
            ":globals" => {
                for (name, value) in self.vm.globals_snapshot() {
                    println!("{} = {}", name, value);
                }
            }
            ":stats" => {
                println!("instructions executed: {}", self.vm.instructions_executed());
                println!("heap bytes:            {}", self.vm.bytes_allocated());
                println!("live objects:          {}", self.vm.live_objects());
                println!("interned strings:      {}", self.vm.interned_strings());
                println!("gc collections:        {}", self.vm.gc_collections());
            }
            other => {
                println!("unknown command '{}'; try :help", other);
            }
        }
        true
    }
}
