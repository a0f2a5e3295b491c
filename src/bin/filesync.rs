use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use filesync::cli::{init_tracing, ClientOpts, Command, ShellCommand, SHELL_USAGE};
use filesync::client::RemoteClient;
use filesync::config::ClientConfig;
use filesync::progress::TransferProgress;
use filesync::session::Session;
use filesync::wire::FileEntry;

fn print_listing(entries: &[&FileEntry]) {
    for e in entries {
        if e.is_directory {
            println!("{}/", e.filename);
        } else {
            println!("{:<32} {}", e.filename, e.filehash);
        }
    }
}

async fn run_once(client: &RemoteClient, progress: bool, command: Command) -> Result<()> {
    let session = Session::new();
    match command {
        Command::Ls { folder } => {
            let entries = client.list_folder(&session.resolve(&folder)?).await?;
            print_listing(&entries.iter().collect::<Vec<_>>());
        }
        Command::Upload { file, folder } => {
            let bar = TransferProgress::new(progress);
            let entry = bar
                .settle(client.upload_file(&file, &session.resolve(&folder)?, &bar).await)
                .with_context(|| format!("upload {}", file.display()))?;
            println!("uploaded {} ({})", entry.path(), entry.filehash);
        }
        Command::Download { filename, folder } => {
            let folder = session.resolve(&folder)?;
            let entry = client
                .list_folder(&folder)
                .await?
                .into_iter()
                .find(|e| e.filename == filename && !e.is_directory)
                .ok_or_else(|| anyhow!("cannot find file {filename} in folder {folder}"))?;
            let bar = TransferProgress::new(progress);
            let dest = bar.settle(client.download_file(&entry, &bar).await)?;
            println!("downloaded {} to {}", entry.path(), dest.display());
        }
        Command::Mkdir { folder } => {
            let entry = client.make_directory(&session.resolve(&folder)?).await?;
            println!("created {}", entry.path());
        }
        Command::Rm { filename, folder } => {
            client.remove_file(&session.resolve(&folder)?, &filename).await?;
        }
        Command::Rmdir { folder } => {
            client.remove_directory(&session.resolve(&folder)?).await?;
        }
        Command::Shell => shell(client, progress).await?,
    }
    Ok(())
}

async fn shell_step(
    client: &RemoteClient,
    session: &mut Session,
    progress: bool,
    command: ShellCommand,
) -> Result<()> {
    match command {
        ShellCommand::Ls(None) => {
            session.refresh(client).await?;
            print_listing(&session.entries());
        }
        ShellCommand::Ls(Some(folder)) => {
            let entries = client.list_folder(&session.resolve(&folder)?).await?;
            print_listing(&entries.iter().collect::<Vec<_>>());
        }
        ShellCommand::Cd(folder) => {
            session.change_directory(client, &folder).await?;
        }
        ShellCommand::Pwd => println!("{}", session.current_directory()),
        ShellCommand::Upload(file, folder) => {
            let folder = session.resolve(folder.as_deref().unwrap_or("."))?;
            let bar = TransferProgress::new(progress);
            bar.settle(client.upload_file(&file, &folder, &bar).await)?;
            if folder == session.current_directory() {
                session.refresh(client).await?;
            }
        }
        ShellCommand::Download(name, folder) => {
            let entry = session.lookup_file(client, &name, folder.as_deref()).await?;
            let bar = TransferProgress::new(progress);
            let dest = bar.settle(client.download_file(&entry, &bar).await)?;
            println!("saved {}", dest.display());
        }
        ShellCommand::Mkdir(folder) => {
            client.make_directory(&session.resolve(&folder)?).await?;
            session.refresh(client).await?;
        }
        ShellCommand::Rm(name, folder) => {
            let folder = session.resolve(folder.as_deref().unwrap_or("."))?;
            client.remove_file(&folder, &name).await?;
            session.refresh(client).await?;
        }
        ShellCommand::Rmdir(folder) => {
            client.remove_directory(&session.resolve(&folder)?).await?;
            session.refresh(client).await?;
        }
        ShellCommand::Help => println!("{SHELL_USAGE}"),
        ShellCommand::Exit => {}
    }
    Ok(())
}

async fn shell(client: &RemoteClient, progress: bool) -> Result<()> {
    let mut session = Session::new();
    session
        .refresh(client)
        .await
        .with_context(|| format!("connect to {}", client.addr()))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout
            .write_all(format!("{}> ", session.current_directory()).as_bytes())
            .await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let command = match ShellCommand::parse(&line) {
            None => continue,
            Some(Err(usage)) => {
                eprintln!("{usage}");
                continue;
            }
            Some(Ok(ShellCommand::Exit)) => break,
            Some(Ok(command)) => command,
        };
        if let Err(e) = shell_step(client, &mut session, progress, command).await {
            eprintln!("error: {e:#}");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    init_tracing(opts.verbose);
    let config = opts.apply(
        ClientConfig::load(opts.config.as_deref()).context("Failed to load client config")?,
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        config.layout().create().await.with_context(|| {
            format!("Failed to create client directories under {}", config.base_dir.display())
        })?;
        let client = RemoteClient::from_config(&config);
        run_once(&client, config.progress, opts.command).await
    })
}
