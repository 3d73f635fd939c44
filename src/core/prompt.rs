//! 交互确认

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;

/// 是/否确认
pub trait Prompter: Send + Sync {
    fn confirm(&self, question: &str) -> bool;
}

/// 从终端读取 y/n
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn confirm(&self, question: &str) -> bool {
        off_worker(|| {
            let stdin = io::stdin();
            let mut input = stdin.lock();
            read_answer(&mut input, &mut io::stderr(), question)
        })
    }
}

/// 在多线程运行时中通过 `block_in_place` 执行阻塞调用，其他情况直接执行
fn off_worker<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// 反复提问直到读到 y/n，EOF 或读取失败视为拒绝
fn read_answer(input: &mut impl BufRead, output: &mut impl Write, question: &str) -> bool {
    loop {
        let _ = write!(output, "{} [y/n]: ", question);
        let _ = output.flush();

        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => return false,
            Ok(_) => {}
        }

        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => return true,
            "n" | "no" => return false,
            _ => continue,
        }
    }
}

/// 非交互模式（重试时使用），一律拒绝
#[derive(Debug, Default)]
pub struct NonInteractivePrompter;

impl Prompter for NonInteractivePrompter {
    fn confirm(&self, question: &str) -> bool {
        debug!("非交互模式，拒绝: {}", question);
        false
    }
}

/// 预设答案，答案用完后拒绝
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<bool>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// 已经问过的问题
    pub fn asked(&self) -> Vec<String> {
        match self.asked.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&self, question: &str) -> bool {
        match self.asked.lock() {
            Ok(mut g) => g.push(question.to_string()),
            Err(poisoned) => poisoned.into_inner().push(question.to_string()),
        }
        match self.answers.lock() {
            Ok(mut g) => g.pop_front().unwrap_or(false),
            Err(poisoned) => poisoned.into_inner().pop_front().unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_answers_in_order_then_declines() {
        let prompter = ScriptedPrompter::new([true, false]);
        assert!(prompter.confirm("q1"));
        assert!(!prompter.confirm("q2"));
        assert!(!prompter.confirm("q3"));
        assert_eq!(prompter.asked(), vec!["q1", "q2", "q3"]);
    }

    #[test]
    fn terminal_answer_repeats_until_yes_or_no() {
        let mut input = io::Cursor::new(b"maybe\nYes\n".to_vec());
        let mut output = Vec::new();
        assert!(read_answer(&mut input, &mut output, "overwrite?"));
        assert_eq!(
            String::from_utf8(output).unwrap().matches("overwrite? [y/n]: ").count(),
            2
        );

        let mut input = io::Cursor::new(b"n\n".to_vec());
        assert!(!read_answer(&mut input, &mut Vec::new(), "q"));
    }

    #[test]
    fn terminal_eof_declines() {
        let mut input = io::Cursor::new(Vec::new());
        assert!(!read_answer(&mut input, &mut Vec::new(), "q"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_read_leaves_multi_thread_worker() {
        assert_eq!(off_worker(|| 7), 7);
    }

    #[tokio::test]
    async fn blocking_read_runs_inline_on_current_thread() {
        assert_eq!(off_worker(|| 7), 7);
    }

    #[test]
    fn non_interactive_always_declines() {
        assert!(!NonInteractivePrompter.confirm("overwrite?"));
    }
}
