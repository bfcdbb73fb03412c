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
use anyhow::Context;
use clap::Parser;
use psdock::config::{BindMount, Prefix, SupervisorConfig};
use psdock::Supervisor;
use std::path::{Path, PathBuf};
use tracing::{debug, error, Level};

#[derive(Parser, Debug)]
#[command(name = "psdock", about = "simple container engine")]
struct Args {
    /// Log debug messages
    #[arg(short = 'd', long = "debug", action)]
    debug: bool,
    /// Container image
    #[arg(short = 'i', long = "image")]
    image: PathBuf,
    /// Container rootfs
    #[arg(short = 'r', long = "rootfs")]
    rootfs: PathBuf,
    /// Standard input/output, the current terminal if not specified
    #[arg(long = "stdio", default_value = "")]
    stdio: String,
    /// Prefix added to each output line (format: <prefix>:<color>)
    #[arg(long = "stdout-prefix")]
    stdout_prefix: Option<Prefix>,
    /// Web hook notified with process status changes
    #[arg(long = "web-hook")]
    web_hook: Option<String>,
    /// Port the process is expected to bind
    #[arg(long = "bind-port")]
    bind_port: Option<u16>,
    /// User inside the container
    #[arg(short = 'u', long = "user", default_value = "root")]
    user: String,
    #[arg(long = "cwd")]
    cwd: Option<String>,
    #[arg(long = "hostname", default_value = "psdock")]
    hostname: String,
    /// Environment variables added to the standard ones
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,
    #[arg(long = "bind-mount")]
    bind_mounts: Vec<BindMount>,
    /// Rotate the output every N hours if stdio is a file
    #[arg(long = "log-rotate", default_value_t = 0)]
    log_rotate: u64,
    /// Seconds before killing the process after forwarding SIGINT or SIGTERM
    #[arg(long = "kill-timeout", default_value_t = -1, allow_negative_numbers = true)]
    kill_timeout: i64,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.as_os_str().is_empty() || path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

impl Args {
    fn into_config(self) -> anyhow::Result<SupervisorConfig> {
        let rootfs = absolute(&self.rootfs).context("cannot resolve rootfs")?;
        let mut config = SupervisorConfig::new(self.image, rootfs, self.command);
        config.stdio = self.stdio;
        config.stdout_prefix = self.stdout_prefix;
        config.web_hook = self.web_hook;
        config.bind_port = self.bind_port;
        config.user = self.user;
        config.cwd = self.cwd;
        config.hostname = self.hostname;
        config.env.extend(self.env);
        config.bind_mounts = self.bind_mounts;
        config.log_rotate = self.log_rotate;
        config.kill_timeout = self.kill_timeout;
        Ok(config)
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    let config = args.into_config()?;
    debug!("{config:#?}");
    let runtime = tokio::runtime::Runtime::new().context("cannot start runtime")?;
    let code = runtime.block_on(Supervisor::new(config).run())?;
    Ok(code)
}

fn main() {
    let args = Args::parse();

    // stdout belongs to the container when attached to the local terminal
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if args.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            1
        }
    };
    std::process::exit(code)
}
