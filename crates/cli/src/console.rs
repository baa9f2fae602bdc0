//! Live console for `watch`: a terminal render sink and the stdin command loop.

#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crcwatch_api::DashboardApi;
use crcwatch_core::columns::{crc_columns, render_header, render_row, ColumnSpec};
use crcwatch_core::markdown::{MarkdownRenderer, TerminalMarkdown};
use crcwatch_core::CaseRunConfiguration;
use crcwatch_ops::{CancelOutcome, Coordinator, DialogView};
use crcwatch_search::FilterCriteria;
use crcwatch_store::{FilterView, RenderSink, SyncHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

use crate::Output;

/// Prints the rows the sync loop renders, stamped with local time. Rows
/// outside the active filter are hidden.
pub struct TerminalSink<W = io::Stdout> {
    output: Output,
    out: W,
    cols: Vec<ColumnSpec>,
    markdown: TerminalMarkdown,
    view: FilterView,
    header_printed: bool,
}

impl TerminalSink {
    pub fn new(output: Output) -> Self { Self::with_writer(output, io::stdout()) }
}

impl<W: Write> TerminalSink<W> {
    pub fn with_writer(output: Output, out: W) -> Self {
        Self { output, out, cols: crc_columns(), markdown: TerminalMarkdown, view: FilterView::default(), header_printed: false }
    }

    fn line(&mut self, text: std::fmt::Arguments<'_>) {
        if let Err(e) = writeln!(self.out, "{}", text) {
            warn!(error = %e, "console: write failed");
        }
    }
}

fn now() -> String { chrono::Local::now().format("%H:%M:%S").to_string() }

impl<W: Write + Send + 'static> RenderSink for TerminalSink<W> {
    fn render(&mut self, crc: &CaseRunConfiguration) {
        if !self.view.is_visible(&crc.id) {
            return;
        }
        match self.output {
            Output::Human => {
                if !self.header_printed {
                    let header = render_header(&self.cols);
                    self.line(format_args!("{:<8} {}", "TIME", header));
                    self.header_printed = true;
                }
                let row = render_row(crc, &self.cols, &self.markdown);
                self.line(format_args!("{:<8} {}", now(), row));
            }
            Output::Json => {
                let line = serde_json::json!({ "ts": now(), "event": "render", "crc": crc });
                self.line(format_args!("{}", line));
            }
        }
    }

    fn apply_visibility(&mut self, view: &FilterView) {
        self.view = view.clone();
        match self.output {
            Output::Human => {
                if view.active {
                    let ids = view.matched.ids().join(" ");
                    self.line(format_args!("-- filter: {} of {} visible: {}", view.matched.len(), view.debug.total, ids));
                } else {
                    self.line(format_args!("-- filter cleared: all {} visible", view.debug.total));
                }
            }
            Output::Json => {
                let line = serde_json::json!({
                    "ts": now(),
                    "event": "visibility",
                    "active": view.active,
                    "visible": view.matched.ids(),
                    "debug": view.debug,
                });
                self.line(format_args!("{}", line));
            }
        }
    }
}

/// One line typed into the live console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Interval(Duration),
    Pause,
    Resume,
    Filter(FilterCriteria),
    Clear,
    Refresh,
    Cancel(String),
    CancelPlan(String),
    CancelAll,
    Press(String),
    Close,
    Status,
    Plans,
    Logs(String),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  interval <ms>        poll period; 0 stops repetition
  pause | resume       suspend or resume auto refresh
  filter <query>       e.g. filter plan:nightly state:running
  clear                drop the filter
  refresh              fetch now
  cancel <id>          cancel one configuration
  cancel-plan <plan>   cancel a plan (filtered when a filter is active)
  cancel-all           cancel everything (filtered when a filter is active)
  yes | no | press <button> | close
  status | plans | logs <id> | help | quit";

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        let need = |what: &str| -> Result<String, String> {
            if rest.is_empty() { Err(format!("{} expects {}", word, what)) } else { Ok(rest.to_string()) }
        };
        let cmd = match word {
            "interval" => {
                let ms = rest.parse::<u64>().map_err(|_| format!("interval expects milliseconds, got {:?}", rest))?;
                ConsoleCommand::Interval(Duration::from_millis(ms))
            }
            "pause" => ConsoleCommand::Pause,
            "resume" => ConsoleCommand::Resume,
            "filter" => ConsoleCommand::Filter(FilterCriteria::parse(rest)),
            "clear" => ConsoleCommand::Clear,
            "refresh" => ConsoleCommand::Refresh,
            "cancel" => ConsoleCommand::Cancel(need("an id")?),
            "cancel-plan" => ConsoleCommand::CancelPlan(need("a plan name")?),
            "cancel-all" => ConsoleCommand::CancelAll,
            "yes" | "y" => ConsoleCommand::Press("yes".into()),
            "no" | "n" => ConsoleCommand::Press("no".into()),
            "ok" => ConsoleCommand::Press("ok".into()),
            "press" => ConsoleCommand::Press(need("a button id")?),
            "close" => ConsoleCommand::Close,
            "status" => ConsoleCommand::Status,
            "plans" => ConsoleCommand::Plans,
            "logs" => ConsoleCommand::Logs(need("an id")?),
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command {:?}; try help", other)),
        };
        Ok(Some(cmd))
    }
}

/// Print a dialog the way a terminal can show it: title, body, buttons.
pub fn print_dialog(view: &DialogView, markdown: &dyn MarkdownRenderer) {
    eprintln!();
    if let Some(title) = &view.title {
        eprintln!("== {} ==", title);
    }
    for line in markdown.render(&view.body).lines() {
        eprintln!("  {}", line);
    }
    let buttons: Vec<String> = view.buttons.iter().map(|(id, label, _)| format!("[{}] {}", id, label)).collect();
    if view.closeable {
        eprintln!("  {}  (close to dismiss)", buttons.join("  "));
    } else {
        eprintln!("  {}", buttons.join("  "));
    }
}

fn report(outcome: &CancelOutcome, co: &Coordinator, markdown: &TerminalMarkdown) {
    match outcome {
        CancelOutcome::AwaitingConfirmation => {
            if let Some(d) = co.dialog() {
                print_dialog(&d.view(), markdown);
            }
        }
        CancelOutcome::Dispatched(_) => eprintln!("cancel sent; the next refresh shows the result"),
        CancelOutcome::Declined => eprintln!("nothing canceled"),
        CancelOutcome::Acknowledged => {}
    }
}

/// Drive the console until quit, Ctrl-C, or the loop stops. A closed stdin
/// leaves the table running until Ctrl-C.
pub async fn run(api: Arc<dyn DashboardApi>, sync: SyncHandle) -> Result<()> {
    let markdown = TerminalMarkdown;
    let mut co = Coordinator::new(Arc::clone(&api));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => { stdin_open = false; continue; }
                    Err(e) => { warn!(error = %e, "console: stdin read failed"); stdin_open = false; continue; }
                };
                let cmd = match ConsoleCommand::parse(&line) {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => continue,
                    Err(msg) => { eprintln!("{}", msg); continue; }
                };
                if cmd == ConsoleCommand::Quit {
                    break;
                }
                if let Err(e) = execute(cmd, &sync, &mut co, api.as_ref(), &markdown).await {
                    eprintln!("error: {}", e);
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping sync loop");
                break;
            }
        }
    }
    sync.stop().await;
    Ok(())
}

async fn execute(
    cmd: ConsoleCommand,
    sync: &SyncHandle,
    co: &mut Coordinator,
    api: &dyn DashboardApi,
    markdown: &TerminalMarkdown,
) -> Result<()> {
    match cmd {
        ConsoleCommand::Interval(d) => sync.set_interval(d).await?,
        ConsoleCommand::Pause => sync.set_paused(true).await?,
        ConsoleCommand::Resume => sync.set_paused(false).await?,
        ConsoleCommand::Filter(criteria) => sync.set_filter(criteria).await?,
        ConsoleCommand::Clear => sync.clear_filter().await?,
        ConsoleCommand::Refresh => sync.refresh_now().await?,
        ConsoleCommand::Cancel(id) => {
            let outcome = co.cancel_one(&id, &sync.current())?;
            report(&outcome, co, markdown);
        }
        ConsoleCommand::CancelPlan(plan) => {
            let scope = sync.filter_view().cancel_scope(Some(&plan));
            eprintln!("{}: {}", scope.label(), plan);
            let outcome = co.cancel_scope(&scope);
            show_refusal(&outcome, co, markdown);
            report(&outcome?, co, markdown);
        }
        ConsoleCommand::CancelAll => {
            let scope = sync.filter_view().cancel_scope(None);
            eprintln!("{}", scope.label());
            let outcome = co.cancel_scope(&scope);
            show_refusal(&outcome, co, markdown);
            report(&outcome?, co, markdown);
        }
        ConsoleCommand::Press(button) => {
            let outcome = co.press(&button)?;
            report(&outcome, co, markdown);
        }
        ConsoleCommand::Close => {
            let outcome = co.dismiss()?;
            report(&outcome, co, markdown);
        }
        ConsoleCommand::Status => {
            let st = sync.status();
            let view = sync.filter_view();
            eprintln!(
                "epoch={} interval_ms={} paused={} issued={} cycles={} failures={} stale={} visible={}/{} dialog={:?}",
                st.epoch, st.interval_ms, st.paused, st.issued, st.cycles, st.failures, st.stale,
                view.matched.len(), view.debug.total, co.state()
            );
            if let Some(err) = &st.last_error {
                eprintln!("last fetch error: {}", err);
            }
        }
        ConsoleCommand::Plans => {
            let snap = sync.current();
            let view = sync.filter_view();
            for plan in snap.plans() {
                let scope = view.cancel_scope(Some(&plan));
                eprintln!("{:<32} {:>5}  [{}]", plan, snap.plan_members(&plan).count(), scope.label());
            }
        }
        ConsoleCommand::Logs(id) => {
            let snap = sync.current();
            match snap.get(&id) {
                Some(crc) => {
                    for (name, url) in crc.log_links(api.link_mode(), &api.logs_root()) {
                        eprintln!("{:<24} {}", name, url);
                    }
                }
                None => eprintln!("no configuration {:?}", id),
            }
        }
        ConsoleCommand::Help => eprintln!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

// Refusals open an alert before returning the error.
fn show_refusal<T>(outcome: &Result<T, crcwatch_ops::CoordinatorError>, co: &Coordinator, markdown: &TerminalMarkdown) {
    if outcome.is_err() {
        if let Some(d) = co.dialog() {
            print_dialog(&d.view(), markdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crcwatch_search::MatchedSet;

    fn crc(id: &str, plan: &str) -> CaseRunConfiguration {
        CaseRunConfiguration {
            id: id.to_string(),
            name: format!("case-{}", id),
            state: "running".to_string(),
            running_for: std::iter::once(plan.to_string()).collect(),
            ..Default::default()
        }
    }

    fn printed(sink: &TerminalSink<Vec<u8>>) -> String { String::from_utf8_lossy(&sink.out).into_owned() }

    #[test]
    fn rows_outside_the_filter_are_not_printed() {
        let mut sink = TerminalSink::with_writer(Output::Json, Vec::new());
        let view = FilterView { active: true, matched: MatchedSet::from_ids(vec!["1".to_string()]), ..Default::default() };
        sink.apply_visibility(&view);
        sink.render(&crc("2", "planB"));
        sink.render(&crc("1", "planA"));
        let out = printed(&sink);
        let renders: Vec<serde_json::Value> = out
            .lines()
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .filter(|v| v["event"] == "render")
            .collect();
        assert_eq!(renders.len(), 1);
        assert_eq!(renders[0]["crc"]["id"], "1");
    }

    #[test]
    fn clearing_the_filter_shows_every_row_again() {
        let mut sink = TerminalSink::with_writer(Output::Human, Vec::new());
        sink.apply_visibility(&FilterView { active: true, matched: MatchedSet::from_ids(vec!["1".to_string()]), ..Default::default() });
        sink.render(&crc("2", "planB"));
        assert!(!printed(&sink).contains("case-2"));
        sink.apply_visibility(&FilterView::default());
        sink.render(&crc("2", "planB"));
        let out = printed(&sink);
        assert!(out.contains("-- filter cleared"));
        assert!(out.contains("case-2"));
        assert!(out.contains("TIME"));
    }

    #[test]
    fn parses_console_lines() {
        assert_eq!(ConsoleCommand::parse("  "), Ok(None));
        assert_eq!(ConsoleCommand::parse("interval 250"), Ok(Some(ConsoleCommand::Interval(Duration::from_millis(250)))));
        assert_eq!(ConsoleCommand::parse("interval 0"), Ok(Some(ConsoleCommand::Interval(Duration::ZERO))));
        assert_eq!(ConsoleCommand::parse("cancel-plan nightly build"), Ok(Some(ConsoleCommand::CancelPlan("nightly build".into()))));
        assert_eq!(ConsoleCommand::parse("y"), Ok(Some(ConsoleCommand::Press("yes".into()))));
        assert_eq!(ConsoleCommand::parse("quit"), Ok(Some(ConsoleCommand::Quit)));
    }

    #[test]
    fn filter_line_goes_through_the_query_parser() {
        let Ok(Some(ConsoleCommand::Filter(c))) = ConsoleCommand::parse("filter plan:planA state:running") else {
            panic!("expected a filter command");
        };
        assert_eq!(c.testplan, "planA");
        assert_eq!(c.state, "running");
        assert_eq!(ConsoleCommand::parse("filter"), Ok(Some(ConsoleCommand::Filter(FilterCriteria::default()))));
    }

    #[test]
    fn bad_lines_explain_themselves() {
        assert!(ConsoleCommand::parse("interval soon").unwrap_err().contains("milliseconds"));
        assert!(ConsoleCommand::parse("cancel").unwrap_err().contains("expects an id"));
        assert!(ConsoleCommand::parse("frobnicate").unwrap_err().contains("unknown command"));
    }
}
