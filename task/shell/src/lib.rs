// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Line-oriented serial command shell.
//!
//! The shell runs as an ordinary task: it polls a non-blocking byte
//! source, edits a line buffer (echo, backspace), and on CR/LF tokenizes
//! the line and dispatches it against a registry of commands. Output goes
//! through a caller-supplied sink, normally the UART driver's TX-ring
//! `write`; formatting is bounded by the line length, and anything beyond
//! that is silently truncated rather than allocated for.
//!
//! I/O is bound as plain function pointers so the shell neither owns nor
//! knows the transport. The builtin command set lives in [`commands`].

#![cfg_attr(not(test), no_std)]

pub mod commands;

use core::fmt;
use heapless::Vec;

/// Maximum command line length, including the implicit terminator slot.
pub const MAX_LINE_LEN: usize = 128;
/// Maximum number of whitespace-separated tokens on a line.
pub const MAX_ARGS: usize = 16;
/// Command registry capacity.
pub const MAX_CMDS: usize = 32;

/// How long the shell task sleeps when no input is pending.
pub const IDLE_POLL_TICKS: u64 = 20;

/// Non-blocking byte source: `None` when nothing is pending.
pub type GetcFn = fn() -> Option<u8>;
/// Byte sink; returns how many bytes were accepted.
pub type PutsFn = fn(&[u8]) -> usize;

/// A command handler: receives the shell (for output) and the tokenized
/// line, `argv[0]` being the command name. Returns 0 on success or a
/// negative status; the shell itself only prints, it does not interpret
/// the status.
pub type CommandFn = fn(&mut Shell, &[&str]) -> i32;

/// One registrable command.
pub struct Command {
    /// Short, space-free name matched against `argv[0]`.
    pub name: &'static str,
    /// One-line description shown by `help`.
    pub help: &'static str,
    pub handler: CommandFn,
}

/// Error from [`Shell::register`]: the registry is at capacity.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegistryFull;

/// Error from [`Shell::unregister`]: no such command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UnknownCommand;

/// Splits `line` on spaces and tabs, pushing up to `MAX_ARGS` token
/// references into `argv`. Extra tokens are dropped, matching the fixed
/// argv of the wire protocol.
pub fn tokenize<'a>(line: &'a str, argv: &mut Vec<&'a str, MAX_ARGS>) {
    for token in line.split([' ', '\t']).filter(|t| !t.is_empty()) {
        if argv.push(token).is_err() {
            break;
        }
    }
}

/// Bounded line formatter. `fmt::Write` into a fixed buffer that drops
/// (rather than errors on) anything past the line length, so a long
/// `write!` can never wedge the shell.
struct LineBuf {
    buf: [u8; MAX_LINE_LEN],
    len: usize,
}

impl LineBuf {
    fn new() -> Self {
        LineBuf {
            buf: [0; MAX_LINE_LEN],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = MAX_LINE_LEN - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        // Truncation is deliberate, not an error.
        Ok(())
    }
}

/// Formatted print through a shell, `print!`-style.
#[macro_export]
macro_rules! sh_print {
    ($sh:expr, $($arg:tt)*) => {
        $sh.print(core::format_args!($($arg)*))
    };
}

/// The shell context: prompt, line buffer, registry, and bound I/O.
pub struct Shell {
    prompt: &'static str,
    getc: GetcFn,
    puts: PutsFn,
    line: Vec<u8, MAX_LINE_LEN>,
    commands: Vec<&'static Command, MAX_CMDS>,
}

impl Shell {
    /// Makes a shell bound to the given I/O. `const` so the instance can
    /// live in a `static`; commands are registered afterwards.
    pub const fn new(prompt: &'static str, getc: GetcFn, puts: PutsFn) -> Self {
        Shell {
            prompt,
            getc,
            puts,
            line: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Adds a command to the registry.
    pub fn register(&mut self, cmd: &'static Command) -> Result<(), RegistryFull> {
        self.commands.push(cmd).map_err(|_| RegistryFull)
    }

    /// Removes a command by name (swap-with-last, order is not
    /// preserved).
    pub fn unregister(&mut self, name: &str) -> Result<(), UnknownCommand> {
        let pos = self
            .commands
            .iter()
            .position(|c| c.name == name)
            .ok_or(UnknownCommand)?;
        self.commands.swap_remove(pos);
        Ok(())
    }

    /// Registered commands, in registration order.
    pub fn commands(&self) -> impl Iterator<Item = &'static Command> + '_ {
        self.commands.iter().copied()
    }

    /// Writes a raw string to the sink.
    pub fn puts(&self, s: &str) {
        (self.puts)(s.as_bytes());
    }

    /// Formats into the bounded line buffer and writes the result.
    pub fn print(&self, args: fmt::Arguments<'_>) {
        let mut buf = LineBuf::new();
        // The sink cannot fail; truncation is absorbed by LineBuf.
        let _ = fmt::write(&mut buf, args);
        (self.puts)(buf.as_bytes());
    }

    /// The shell task body: banner, prompt, then the poll loop. Sleeps
    /// [`IDLE_POLL_TICKS`] whenever the byte source runs dry.
    pub fn run(&mut self) -> ! {
        self.puts("\r\n");
        self.puts(self.prompt);
        loop {
            match (self.getc)() {
                Some(byte) => self.feed(byte),
                None => {
                    let _ = kern::syscalls::sleep_ticks(IDLE_POLL_TICKS);
                }
            }
        }
    }

    /// Feeds one input byte through the line editor. CR or LF finishes
    /// the line and dispatches it; backspace/DEL erase; printable ASCII
    /// is buffered and echoed; everything else is dropped. Input past a
    /// full line is discarded.
    pub fn feed(&mut self, byte: u8) {
        match byte {
            b'\r' | b'\n' => {
                self.puts("\r\n");
                self.process_line();
                self.line.clear();
                self.puts(self.prompt);
            }
            0x08 | 0x7F => {
                if self.line.pop().is_some() {
                    // Visual erase: back, space, back.
                    self.puts("\x08 \x08");
                }
            }
            0x20..=0x7E => {
                if self.line.len() < MAX_LINE_LEN - 1 && self.line.push(byte).is_ok() {
                    let echo = [byte];
                    (self.puts)(&echo);
                }
            }
            _ => {}
        }
    }

    /// Tokenizes and dispatches the buffered line. Empty lines just
    /// reprompt.
    fn process_line(&mut self) {
        // Take the buffer so argv can borrow it while handlers borrow
        // the shell.
        let line = core::mem::take(&mut self.line);
        let text = core::str::from_utf8(&line).unwrap_or("");

        let mut argv: Vec<&str, MAX_ARGS> = Vec::new();
        tokenize(text, &mut argv);
        if argv.is_empty() {
            return;
        }

        let handler = self
            .commands
            .iter()
            .find(|c| c.name == argv[0])
            .map(|c| c.handler);
        match handler {
            Some(handler) => {
                // Status is informational only.
                let _ = handler(self, &argv);
            }
            None => {
                sh_print!(self, "Unknown command: {}\r\n", argv[0]);
                sh_print!(self, "Type 'help' for list.\r\n");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The I/O bindings are plain fn pointers, so test output funnels
    // through process-wide statics; GUARD serializes the tests that use
    // them.
    static GUARD: Mutex<()> = Mutex::new(());
    static OUT: Mutex<std::vec::Vec<u8>> = Mutex::new(std::vec::Vec::new());

    fn no_input() -> Option<u8> {
        None
    }

    fn capture_puts(bytes: &[u8]) -> usize {
        OUT.lock().unwrap().extend_from_slice(bytes);
        bytes.len()
    }

    fn drain_output() -> String {
        String::from_utf8(std::mem::take(&mut *OUT.lock().unwrap())).unwrap()
    }

    fn shell() -> Shell {
        OUT.lock().unwrap().clear();
        Shell::new("OS> ", no_input, capture_puts)
    }

    fn type_line(sh: &mut Shell, line: &str) {
        for b in line.bytes() {
            sh.feed(b);
        }
        sh.feed(b'\r');
    }

    #[test]
    fn tokenize_splits_on_whitespace_runs() {
        let mut argv: Vec<&str, MAX_ARGS> = Vec::new();
        tokenize("  kill \t 12  now ", &mut argv);
        assert_eq!(&argv[..], &["kill", "12", "now"]);
    }

    #[test]
    fn tokenize_caps_at_max_args() {
        let line = "a ".repeat(MAX_ARGS + 5);
        let mut argv: Vec<&str, MAX_ARGS> = Vec::new();
        tokenize(&line, &mut argv);
        assert_eq!(argv.len(), MAX_ARGS);
    }

    #[test]
    fn line_buf_truncates_at_line_length() {
        use core::fmt::Write;
        let mut buf = LineBuf::new();
        let long = "x".repeat(MAX_LINE_LEN * 2);
        buf.write_str(&long).unwrap();
        write!(buf, "{}", 12345).unwrap();
        assert_eq!(buf.as_bytes().len(), MAX_LINE_LEN);
    }

    #[test]
    fn unknown_command_message() {
        let _guard = GUARD.lock().unwrap();
        let mut sh = shell();
        type_line(&mut sh, "frobnicate");
        let out = drain_output();
        assert!(out.contains("Unknown command: frobnicate\r\n"), "{out:?}");
        assert!(out.contains("Type 'help' for list.\r\n"));
        assert!(out.ends_with("OS> "));
    }

    #[test]
    fn empty_line_just_reprompts() {
        let _guard = GUARD.lock().unwrap();
        let mut sh = shell();
        sh.feed(b'\r');
        let out = drain_output();
        assert_eq!(out, "\r\nOS> ");
    }

    #[test]
    fn backspace_edits_and_stops_at_column_zero() {
        let _guard = GUARD.lock().unwrap();
        let mut sh = shell();
        sh.feed(b'x');
        sh.feed(0x08);
        // A second erase with an empty buffer must not emit anything.
        sh.feed(0x7F);
        let out = drain_output();
        assert_eq!(out, "x\x08 \x08");

        // The erased character is really gone from the line.
        type_line(&mut sh, "y");
        let out = drain_output();
        assert!(out.contains("Unknown command: y\r\n"), "{out:?}");
    }

    #[test]
    fn overlong_input_is_dropped_not_wrapped() {
        let _guard = GUARD.lock().unwrap();
        let mut sh = shell();
        for _ in 0..MAX_LINE_LEN + 50 {
            sh.feed(b'a');
        }
        // Echo stops once the buffer is full.
        assert_eq!(drain_output().len(), MAX_LINE_LEN - 1);
        sh.feed(b'\r');
        let out = drain_output();
        assert!(out.contains("Unknown command:"));
    }

    #[test]
    fn dispatch_reaches_handler_with_argv() {
        static HITS: Mutex<std::vec::Vec<String>> = Mutex::new(std::vec::Vec::new());
        fn spy(_sh: &mut Shell, argv: &[&str]) -> i32 {
            HITS.lock()
                .unwrap()
                .extend(argv.iter().map(|s| s.to_string()));
            0
        }
        static SPY: Command = Command {
            name: "spy",
            help: "records argv",
            handler: spy,
        };

        let _guard = GUARD.lock().unwrap();
        let mut sh = shell();
        sh.register(&SPY).unwrap();
        type_line(&mut sh, "spy one two");
        assert_eq!(&*HITS.lock().unwrap(), &["spy", "one", "two"]);
    }

    #[test]
    fn help_lists_registered_commands() {
        let _guard = GUARD.lock().unwrap();
        let mut sh = shell();
        commands::register_all(&mut sh).unwrap();
        type_line(&mut sh, "help");
        let out = drain_output();
        let help_at = out.find("Available commands:\r\n").unwrap();
        for name in ["help", "tasks", "heap", "uptime", "kill", "reboot", "heaptest"] {
            let pos = out.find(&format!("  {name}")).unwrap();
            assert!(pos > help_at, "{name} listed before header");
        }
        assert!(out.ends_with("OS> "));
    }

    #[test]
    fn registry_capacity_and_unregister() {
        let _guard = GUARD.lock().unwrap();
        let mut sh = shell();
        static FILLER: Command = Command {
            name: "filler",
            help: "",
            handler: |_, _| 0,
        };
        for _ in 0..MAX_CMDS {
            sh.register(&FILLER).unwrap();
        }
        assert_eq!(sh.register(&FILLER), Err(RegistryFull));
        sh.unregister("filler").unwrap();
        assert!(sh.register(&FILLER).is_ok());
        assert_eq!(sh.unregister("nope"), Err(UnknownCommand));
    }
}
