use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use notebook::document::Document;
use notebook::kernel::KernelspecInfo;
use notebook::launcher::{connection_file_for, interrupt_kernel};
use notebook::reducer::reduce;
use notebook::settings::{load_settings, settings_path, settings_schema};
use notebook::state::Notification;
use notebook::{
    read_notebook, write_notebook, Action, CellId, CellStatus, CellType, ExecutionEngine,
    KernelLifecycle, KernelRef, LifecycleConfig, Notebook, NotebookState, RuntimelibLauncher,
    Store, StoreHandle,
};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a notebook with one empty code cell
    New {
        path: PathBuf,
        /// Kernelspec to record (default: from settings)
        #[arg(short, long)]
        kernel: Option<String>,
    },
    /// List the cells of a notebook
    Show {
        path: PathBuf,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Clear every output and execution count
    Clear { path: PathBuf },
    /// Run every code cell on a fresh kernel and save the results
    Run {
        path: PathBuf,
        /// Kernelspec to launch (default: the notebook's, then settings)
        #[arg(short, long)]
        kernel: Option<String>,
        /// Write here instead of back to the input file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Seconds to wait for all cells (default: from settings)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Interrupt a kernel started by `runt run`
    Interrupt {
        /// Kernel id from the launch log, or a connection file path
        id: String,
    },
    /// Show settings, or their JSON Schema
    Settings {
        #[arg(long)]
        schema: bool,
    },
}

#[derive(Tabled, Serialize)]
struct CellRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "TYPE")]
    cell_type: String,
    #[tabled(rename = "COUNT")]
    execution_count: String,
    #[tabled(rename = "OUTPUTS")]
    outputs: usize,
    #[tabled(rename = "SOURCE")]
    source: String,
}

fn cell_rows(notebook: &Notebook) -> Vec<CellRow> {
    notebook
        .cells()
        .enumerate()
        .map(|(index, (id, cell))| CellRow {
            index,
            id: id.to_string(),
            cell_type: cell.cell_type().to_string(),
            execution_count: cell
                .execution_count()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            outputs: cell.outputs().len(),
            source: first_line(cell.source(), 48),
        })
        .collect()
}

/// First line of `text`, cut to `max_len` characters.
fn first_line(text: &str, max_len: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= max_len {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max_len - 3).collect();
        format!("{}...", cut)
    }
}

/// Shorten a path for display by replacing home directory with ~
fn shorten_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(relative) = path.strip_prefix(&home) {
            return format!("~/{}", relative.display());
        }
    }
    path.display().to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::New { path, kernel } => new_notebook(&path, kernel).await,
        Commands::Show { path, json } => show(&path, json),
        Commands::Clear { path } => clear(&path),
        Commands::Run {
            path,
            kernel,
            output,
            timeout,
        } => run(&path, kernel, output, timeout).await,
        Commands::Interrupt { id } => interrupt(&id).await,
        Commands::Settings { schema } => show_settings(schema),
    }
}

async fn new_notebook(path: &Path, kernel: Option<String>) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let kernel_name = kernel.unwrap_or_else(|| load_settings().default_kernel);
    let kernelspec = match runtimelib::find_kernelspec(&kernel_name).await {
        Ok(found) => KernelspecInfo {
            name: kernel_name.clone(),
            display_name: found.kernelspec.display_name,
            language: found.kernelspec.language,
        },
        Err(e) => {
            warn!("Kernelspec {} not found locally: {}", kernel_name, e);
            KernelspecInfo {
                name: kernel_name.clone(),
                display_name: kernel_name.clone(),
                language: String::new(),
            }
        }
    };

    let doc = Document::from_notebook(Notebook::new());
    let doc = reduce(&doc, &Action::create_cell_if_empty(CellType::Code));
    let doc = reduce(
        &doc,
        &Action::SetKernelspecInfo {
            kernel_ref: KernelRef::new(),
            kernelspec,
        },
    );
    write_notebook(path, doc.notebook())?;
    println!("Created {} ({})", shorten_path(path), kernel_name);
    Ok(())
}

fn show(path: &Path, json: bool) -> Result<()> {
    let notebook = read_notebook(path).with_context(|| format!("reading {}", path.display()))?;
    let rows = cell_rows(&notebook);
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("No cells.");
    } else {
        println!("{}", Table::new(rows).with(Style::rounded()));
    }
    Ok(())
}

fn clear(path: &Path) -> Result<()> {
    let notebook = read_notebook(path).with_context(|| format!("reading {}", path.display()))?;
    let doc = reduce(&Document::from_notebook(notebook), &Action::ClearAllOutputs);
    write_notebook(path, doc.notebook())?;
    println!("Cleared outputs in {}", shorten_path(path));
    Ok(())
}

async fn run(
    path: &Path,
    kernel: Option<String>,
    output: Option<PathBuf>,
    timeout: Option<u64>,
) -> Result<()> {
    let settings = load_settings();
    let notebook = read_notebook(path).with_context(|| format!("reading {}", path.display()))?;
    let kernel_name = kernel
        .or_else(|| notebook.kernelspec_name().map(str::to_string))
        .unwrap_or_else(|| settings.default_kernel.clone());
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.execution_timeout());

    let code_cells: Vec<CellId> = notebook
        .cells()
        .filter(|(_, cell)| cell.cell_type() == CellType::Code)
        .map(|(id, _)| id.clone())
        .collect();

    let store = Store::spawn(NotebookState::new(notebook, Some(path.to_path_buf())));
    let handle = store.handle();
    let launcher = Arc::new(RuntimelibLauncher::new());
    let lifecycle = KernelLifecycle::spawn(
        handle.clone(),
        launcher.clone(),
        LifecycleConfig::from_settings(&settings),
    );
    let engine = ExecutionEngine::spawn(handle.clone());
    let interrupts = tokio::spawn(forward_interrupts(handle.clone()));
    let startup = Duration::from_secs(settings.launch_timeout_secs + settings.kernel_info_timeout_secs);

    let result = async {
        info!("Launching {}", kernel_name);
        handle.dispatch(Action::launch_kernel_by_name(kernel_name.as_str()));
        let state = tokio::time::timeout(
            startup,
            handle.wait_for(|s| s.kernel.accepts_execution() || has_failure(&s.notifications)),
        )
        .await
        .with_context(|| format!("kernel {} did not become ready", kernel_name))?
        .context("store stopped")?;
        bail_on_failure(&state.notifications)?;

        handle.dispatch(Action::ExecuteAllCells);
        let finished = |s: &NotebookState| {
            code_cells.iter().all(|id| {
                s.document.cell_status(id) == Some(CellStatus::Idle)
                    && s.notebook().cell(id).and_then(|c| c.execution_count()).is_some()
            })
        };
        let state = tokio::time::timeout(
            timeout,
            handle.wait_for(|s| finished(s.as_ref()) || has_failure(&s.notifications)),
        )
        .await
        .with_context(|| format!("cells did not finish within {}s", timeout.as_secs()))?
        .context("store stopped")?;
        bail_on_failure(&state.notifications)?;
        Ok::<_, anyhow::Error>(state)
    }
    .await;

    interrupts.abort();
    if let Some(kernel_ref) = handle.state().kernel.kernel_ref.clone() {
        handle.dispatch(Action::ShutdownKernel { kernel_ref });
    }
    engine.shutdown();
    lifecycle.shutdown();
    launcher.shutdown_all().await;
    store.shutdown();

    let state = result?;
    let target = output.unwrap_or_else(|| path.to_path_buf());
    write_notebook(&target, state.notebook())?;

    println!("{}", Table::new(cell_rows(state.notebook())).with(Style::rounded()));
    println!("Wrote {}", shorten_path(&target));
    Ok(())
}

/// Notification kinds that end a `run`.
///
/// Errors raised inside cells are outputs, and a kernel that never answers
/// `kernel_info_request` can still execute.
const FATAL_FAILURES: &[&str] = &["LAUNCH_KERNEL_FAILED", "ERROR_EXECUTING", "RESTART_KERNEL_FAILED"];

fn is_fatal(notification: &Notification) -> bool {
    let kind = notification
        .key
        .split_once(':')
        .map_or(notification.key.as_str(), |(kind, _)| kind);
    FATAL_FAILURES.contains(&kind)
}

fn has_failure(notifications: &[Notification]) -> bool {
    notifications.iter().any(is_fatal)
}

fn bail_on_failure(notifications: &[Notification]) -> Result<()> {
    for notification in notifications {
        if is_fatal(notification) {
            bail!("{}: {}", notification.key, notification.message);
        }
        warn!("{}: {}", notification.key, notification.message);
    }
    Ok(())
}

/// Turn Ctrl-C into an interrupt of the current kernel.
///
/// Without a connected kernel there is nothing to interrupt and the process exits.
async fn forward_interrupts(handle: StoreHandle) {
    while tokio::signal::ctrl_c().await.is_ok() {
        let state = handle.state();
        match (&state.kernel.kernel_ref, &state.kernel.kernel) {
            (Some(kernel_ref), Some(_)) => {
                eprintln!("Interrupting kernel {}", kernel_ref);
                handle.dispatch(Action::InterruptKernel {
                    kernel_ref: kernel_ref.clone(),
                });
            }
            _ => std::process::exit(130),
        }
    }
}

async fn interrupt(id: &str) -> Result<()> {
    let connection_file = connection_file_for(id);
    interrupt_kernel(&connection_file).await?;
    println!("Interrupt sent to kernel {}", id);
    Ok(())
}

fn show_settings(schema: bool) -> Result<()> {
    if schema {
        println!("{}", settings_schema()?);
        return Ok(());
    }
    println!("{}", shorten_path(&settings_path()));
    println!("{}", serde_json::to_string_pretty(&load_settings())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notebook::Cell;

    #[test]
    fn test_first_line_truncates() {
        assert_eq!(first_line("import os\nimport sys", 48), "import os");
        assert_eq!(first_line("abcdefghij", 8), "abcde...");
        assert_eq!(first_line("", 8), "");
    }

    #[test]
    fn test_only_launch_and_execution_failures_are_fatal() {
        let notification = |key: &str| Notification {
            key: key.to_string(),
            message: "failed".to_string(),
        };
        let advisory = vec![
            notification("KERNEL_INFO_FAILED:k1"),
            notification("INTERRUPT_KERNEL_FAILED:k1"),
            notification("ERROR_UPDATE_DISPLAY"),
        ];
        assert!(!has_failure(&advisory));
        assert!(bail_on_failure(&advisory).is_ok());

        for key in ["LAUNCH_KERNEL_FAILED:k1", "ERROR_EXECUTING:c1", "RESTART_KERNEL_FAILED:k2"] {
            let mut notifications = advisory.clone();
            notifications.push(notification(key));
            assert!(has_failure(&notifications), "{key}");
            let error = bail_on_failure(&notifications).unwrap_err();
            assert!(error.to_string().starts_with(key));
        }
    }

    #[test]
    fn test_cell_rows() {
        let notebook = Notebook::from_cells([
            (CellId::from("a"), Cell::markdown("# Title")),
            (CellId::from("b"), Cell::code("x = 1\ny = 2")),
        ]);
        let rows = cell_rows(&notebook);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cell_type, "markdown");
        assert_eq!(rows[1].id, "b");
        assert_eq!(rows[1].execution_count, "-");
        assert_eq!(rows[1].source, "x = 1");
    }
}
