/*!
The `strongbox-cli` binary provides a lightweight wrapper over the core `strongbox`
logic, providing simple set of commands for directly interacting with
repositories.
 */
#[cfg_attr(tarpaulin, skip)]
mod cli;
mod util;

#[cfg_attr(tarpaulin, skip)]
mod cache;
#[cfg_attr(tarpaulin, skip)]
mod check;
#[cfg_attr(tarpaulin, skip)]
mod compact;
#[cfg_attr(tarpaulin, skip)]
mod create;
#[cfg_attr(tarpaulin, skip)]
mod extract;
#[cfg_attr(tarpaulin, skip)]
mod info;
#[cfg_attr(tarpaulin, skip)]
mod init;
#[cfg_attr(tarpaulin, skip)]
mod key;
#[cfg_attr(tarpaulin, skip)]
mod list;
#[cfg_attr(tarpaulin, skip)]
mod serve;

use anyhow::Result;
use cli::{Command, Opt};
use structopt::StructOpt;

#[cfg_attr(tarpaulin, skip)]
#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let options = Opt::from_args();
    let command = options.command.clone();
    match command {
        Command::Init => init::init(options).await,
        Command::Create { target, name } => create::create(options, target, name).await,
        Command::Extract { target, archive } => extract::extract(options, target, archive).await,
        Command::List => list::list(options).await,
        Command::Info => info::info(options).await,
        Command::Check {
            repair,
            verify_data,
            max_duration,
        } => check::check(options, repair, verify_data, max_duration).await,
        Command::Compact => compact::compact(options).await,
        Command::Key => key::key(options).await,
        Command::Serve {
            bind,
            append_only,
            storage_quota,
        } => serve::serve(options, bind, append_only, storage_quota).await,
    }
}
