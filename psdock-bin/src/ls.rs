// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.
use clap::Parser;
use psdock::config::default_state_root;
use psdock::state::ContainerStateFile;
use std::path::PathBuf;
use term_table::homogeneous::{TableLayout, TableSource, Title};
use term_table::{ColumnLayout, Pos};

const COLUMNS: [&str; 6] = ["#", "CONTAINER_ID", "ROOTFS", "PID", "INIT_PID", "COMMAND"];

#[derive(Parser, Debug)]
#[command(name = "psdock-ls", about = "list running psdock containers")]
struct Args {
    #[arg(long = "state-root")]
    state_root: Option<PathBuf>,
}

struct PrintState<'a> {
    index: usize,
    state: &'a ContainerStateFile,
}

impl<'a> PrintState<'a> {
    /// Command line of the init process as the kernel reports it
    fn command(&self) -> String {
        self.state
            .init_pid
            .and_then(|pid| linux::proc::cmdline(pid).ok())
            .filter(|cmdline| !cmdline.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl<'a> TableSource for PrintState<'a> {
    fn value_for_column(&self, column: &str) -> Option<String> {
        match column {
            "#" => Some(self.index.to_string()),
            "CONTAINER_ID" => Some(self.state.id.clone()),
            "ROOTFS" => Some(self.state.rootfs.to_string_lossy().to_string()),
            "PID" => Some(self.state.launcher_pid.to_string()),
            "INIT_PID" => Some(
                self.state
                    .init_pid
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            "COMMAND" => Some(self.command()),
            _ => None,
        }
    }
}

fn format_table(states: &[ContainerStateFile]) -> String {
    fn make_standard_column() -> ColumnLayout {
        ColumnLayout::align(Pos::Left, ' ')
    }

    let titles = COLUMNS
        .iter()
        .map(|column| (Title::new(column, column), make_standard_column()))
        .collect::<Vec<_>>();
    let mut layout = TableLayout::new("  ", true, titles);
    for (index, state) in states.iter().enumerate() {
        layout.append_data(PrintState { index, state });
    }
    layout.flush()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args = Args::parse();
    let state_root = args.state_root.unwrap_or_else(default_state_root);
    let states = ContainerStateFile::list(&state_root)?;

    if states.is_empty() {
        println!("No psdock container running");
    } else {
        println!("{}", format_table(&states));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(line: &str) -> Vec<&str> {
        line.split_whitespace().collect()
    }

    #[test]
    fn test_format_table() {
        let mut state = ContainerStateFile::new("psdock_abcdefg", "/tmp/rootfs", vec!["sh".into()]);
        state.launcher_pid = 100;
        let table = format_table(&[state]);
        let lines = table
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert_eq!(fields(lines[0]), COLUMNS);
        assert_eq!(
            fields(lines[1]),
            ["0", "psdock_abcdefg", "/tmp/rootfs", "100", "-", "unknown"]
        );
        // columns are aligned on the title
        let rootfs_column = lines[0].find("ROOTFS").unwrap();
        assert_eq!(lines[1].find("/tmp/rootfs"), Some(rootfs_column));
    }

    #[test]
    fn test_command_of_running_process() {
        let mut state = ContainerStateFile::new("psdock_abcdefg", "/tmp/rootfs", Vec::new());
        state.init_pid = Some(std::process::id());
        let row = PrintState {
            index: 0,
            state: &state,
        };
        assert_eq!(
            row.value_for_column("INIT_PID"),
            Some(std::process::id().to_string())
        );
        assert_ne!(row.command(), "unknown");
        assert_eq!(row.value_for_column("NAME"), None);
    }
}
