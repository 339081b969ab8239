use crate::provider::{JavaRuntime, ThreadRecord};
use std::io::{self, Write};

/// Human readable stacks and stack locals of every thread, written next to
/// the index as `<prefix>threads`.
///
/// Write failures are remembered and reported once by [`ThreadReport::finish`].
pub struct ThreadReport {
    out: Box<dyn Write>,
    error: Option<io::Error>,
}

impl ThreadReport {
    pub fn new(out: impl Write + 'static) -> Self {
        ThreadReport {
            out: Box::new(out),
            error: None,
        }
    }

    fn emit(&mut self, text: &str) {
        if self.error.is_none() {
            if let Err(e) = self.out.write_all(text.as_bytes()) {
                self.error = Some(e);
            }
        }
    }

    /// Header and frames of `thread`, followed by the locals heading
    pub fn write_thread(&mut self, rt: &dyn JavaRuntime, thread: &ThreadRecord) {
        let text = format_thread(rt, thread);
        self.emit(&text);
    }

    pub fn write_local(&mut self, target: u64, frame: usize) {
        self.emit(&format!("  objecId=0x{:x}, line={}\n", target, frame));
    }

    pub fn end_thread(&mut self) {
        self.emit("\n");
    }

    pub fn finish(mut self) -> io::Result<()> {
        match self.error.take() {
            Some(e) => Err(e),
            None => self.out.flush(),
        }
    }
}

fn format_thread(rt: &dyn JavaRuntime, thread: &ThreadRecord) -> String {
    let mut s = String::from("Thread ");
    match thread.object {
        Ok(Some(a)) => s.push_str(&format!("0x{:x}\n", a)),
        _ => s.push_str("<unknown>\n"),
    }
    for frame in rt.stack_frames(thread) {
        s.push_str(" at ");
        let location = match frame.map(|f| f.location) {
            Ok(Ok(l)) => l,
            _ => {
                s.push('\n');
                continue;
            }
        };
        if let Ok(method) = &location.method {
            if let Ok(Ok(name)) = rt.class(method.declaring).map(|c| c.name) {
                s.push_str(&name.replace('/', "."));
                s.push('.');
            }
            s.push_str(&method.name);
            if let Ok(sig) = &method.signature {
                s.push_str(sig);
            }
            s.push(' ');
            if method.is_native() {
                s.push_str("(Native Method)\n");
                continue;
            }
        }
        match &location.file_name {
            Ok(file) => {
                s.push('(');
                s.push_str(file);
                if let Ok(line) = location.line_number {
                    s.push_str(&format!(":{}", line));
                }
                s.push(')');
            }
            Err(_) => s.push_str("(Unknown Source)"),
        }
        s.push('\n');
    }
    s.push_str("\n locals:\n");
    s
}
