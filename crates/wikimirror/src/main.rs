use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wikimirror_core::assets::{commit_assets, mirror_assets_with};
use wikimirror_core::inspect::{page_history_lines, page_tree, tree_lines};
use wikimirror_core::links::check_links;
use wikimirror_core::page_file::template;
use wikimirror_core::publish::create_page_from_file;
use wikimirror_core::reconcile::{ReconcileOptions, ReconcileReport, RunMode, reconcile_with};
use wikimirror_core::runtime::{PathOverrides, ResolutionContext, ResolvedPaths, resolve_paths};
use wikimirror_core::store::ContentStore;
use wikimirror_core::sync::sync_pages;
use wikimirror_core::vcs::{GitCli, VersionControl};
use wikimirror_core::wikijs::{WikiJsClient, WikiJsClientConfig};

#[derive(Debug, Parser)]
#[command(
    name = "wikimirror",
    version,
    about = "Mirror a Wiki.js site, history included, into a git working tree"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    mirror_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    mirror_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            mirror_root: cli.mirror_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Replay new page history as commits, then mirror assets")]
    Mirror(MirrorArgs),
    #[command(about = "Mirror the asset tree only")]
    Assets,
    #[command(about = "Write the live version of every page, without history")]
    Sync(SyncArgs),
    #[command(about = "Print the page tree")]
    Tree(TreeArgs),
    #[command(about = "Print the classified history of one page")]
    History(HistoryArgs),
    #[command(about = "Create an empty page file to author locally")]
    Template(TemplateArgs),
    #[command(about = "Publish a locally authored page file as a new page")]
    Create(CreateArgs),
    #[command(about = "Report links to pages that do not exist")]
    Check,
}

#[derive(Debug, Args)]
struct MirrorArgs {
    #[arg(long, help = "Do not touch the asset directory")]
    skip_assets: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, value_name = "PATH", help = "Target directory (default: <project-root>/sync)")]
    dir: Option<PathBuf>,
    #[arg(long, help = "Rewrite files even when their updatedAt header is current")]
    force: bool,
}

#[derive(Debug, Args)]
struct TreeArgs {
    #[arg(long, help = "Restrict to one locale")]
    locale: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    locale: String,
    path: String,
    #[arg(long, help = "Show content diffs between consecutive versions")]
    diff: bool,
}

#[derive(Debug, Args)]
struct TemplateArgs {
    locale: String,
    path: String,
    #[arg(long, default_value = "markdown")]
    content_type: String,
    #[arg(long, value_name = "PATH", help = "Target directory (default: <project-root>)")]
    dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CreateArgs {
    file: PathBuf,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Mirror(args)) => run_mirror(&runtime, args),
        Some(Commands::Assets) => run_assets(&runtime),
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::Tree(args)) => run_tree(&runtime, args),
        Some(Commands::History(args)) => run_history(&runtime, args),
        Some(Commands::Template(args)) => run_template(&runtime, args),
        Some(Commands::Create(args)) => run_create(&runtime, args),
        Some(Commands::Check) => run_check(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_mirror(runtime: &RuntimeOptions, args: MirrorArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let mut client = open_client(&paths)?;
    let mut git = open_git(&paths);
    let options = ReconcileOptions {
        watermark_file: PathBuf::from(paths.config.watermark_file_name()),
        collation_locale: paths.config.collation_locale(),
    };

    let mut log_progress = |percent: u8| tracing::info!(percent, "replaying history");
    let progress: &mut dyn FnMut(u8) = &mut log_progress;
    let report = reconcile_with(&mut client, &mut git, &options, Some(progress))?;

    println!("mirror");
    println!("mirror_root: {}", normalize_path(&paths.mirror_root));
    print_reconcile_report(&report);

    if args.skip_assets {
        println!("assets: skipped");
    } else {
        let asset_root = paths.asset_root();
        let assets = mirror_assets_with(&mut client, &asset_root)?;
        let committed = commit_assets(&mut git, &asset_root, Utc::now())?;
        println!("assets.folders: {}", assets.folders);
        println!("assets.downloaded: {}", assets.downloaded);
        println!("assets.current: {}", assets.current);
        println!("assets.deleted: {}", assets.deleted);
        println!("assets.committed: {}", format_flag(committed));
    }
    println!("request_count: {}", client.request_count());
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_assets(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let mut client = open_client(&paths)?;
    let mut git = open_git(&paths);
    let asset_root = paths.asset_root();

    let report = mirror_assets_with(&mut client, &asset_root)?;
    let committed = if git.is_repository() {
        commit_assets(&mut git, &asset_root, Utc::now())?
    } else {
        false
    };

    println!("assets");
    println!("asset_root: {}", normalize_path(&asset_root));
    println!("folders: {}", report.folders);
    println!("downloaded: {}", report.downloaded);
    println!("current: {}", report.current);
    println!("deleted: {}", report.deleted);
    println!("committed: {}", format_flag(committed));
    println!("request_count: {}", report.request_count);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let mut client = open_client(&paths)?;
    let dir = args
        .dir
        .map(|dir| absolutize(&dir, &paths.project_root))
        .unwrap_or_else(|| paths.project_root.join("sync"));

    let report = sync_pages(&mut client, &dir, args.force)?;

    println!("sync");
    println!("dir: {}", normalize_path(&dir));
    println!("pages: {}", report.pages);
    println!("written: {}", report.written.len());
    for path in &report.written {
        println!("written.file: {}", normalize_path(path));
    }
    println!("current: {}", report.current);
    println!("request_count: {}", report.request_count);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_tree(runtime: &RuntimeOptions, args: TreeArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let mut client = open_client(&paths)?;
    let pages = client.list_pages()?;
    let tree = page_tree(&pages, &paths.config.collation_locale())?;

    let start = match (&args.locale, &args.path) {
        (Some(locale), Some(path)) => format!("/{locale}/{}", path.trim_matches('/')),
        (Some(locale), None) => format!("/{locale}"),
        (None, Some(path)) => path.clone(),
        (None, None) => "/".to_string(),
    };
    for line in tree_lines(&tree, &start)? {
        let indent = "  ".repeat(line.depth);
        let marker = if line.is_folder { "/" } else { "" };
        match &line.page {
            Some(page) => println!(
                "{indent}{}{marker}  [{}] {} ({})",
                line.name, page.id, page.title, page.content_type
            ),
            None => println!("{indent}{}{marker}", line.name),
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_history(runtime: &RuntimeOptions, args: HistoryArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let mut client = open_client(&paths)?;
    let lines = page_history_lines(&mut client, &args.locale, &args.path, args.diff)?;

    println!("history {}/{}", args.locale, args.path.trim_matches('/'));
    println!("versions: {}", lines.len());
    for line in &lines {
        let version = line
            .version_id
            .map_or_else(|| "current".to_string(), |id| id.to_string());
        let author = line.author.as_deref().unwrap_or("-");
        match &line.moved_from {
            Some(from) => println!(
                "{} {version} {author} {} ({}) {from} -> {}",
                line.date.to_rfc3339(),
                line.tag,
                line.action_type,
                line.path
            ),
            None => println!(
                "{} {version} {author} {} ({}) {}",
                line.date.to_rfc3339(),
                line.tag,
                line.action_type,
                line.path
            ),
        }
        if let Some(diff) = &line.diff {
            print!("{diff}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_template(runtime: &RuntimeOptions, args: TemplateArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let dir = args
        .dir
        .map(|dir| absolutize(&dir, &paths.project_root))
        .unwrap_or_else(|| paths.project_root.clone());

    match template(&dir, &args.locale, &args.path, &args.content_type)? {
        Some(path) => println!("template: {}", normalize_path(&path)),
        None => bail!(
            "a page file for {}/{} already exists under {}",
            args.locale,
            args.path.trim_matches('/'),
            normalize_path(&dir)
        ),
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_create(runtime: &RuntimeOptions, args: CreateArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let mut client = open_client(&paths)?;
    let file = absolutize(&args.file, &paths.project_root);

    let report = create_page_from_file(&mut client, &file)?;

    println!("create");
    println!("file: {}", normalize_path(&report.file));
    println!("page: {}", report.key);
    println!("id: {}", report.page.id);
    if let Some(updated_at) = report.page.updated_at {
        println!("updated_at: {}", updated_at.to_rfc3339());
    }
    println!("request_count: {}", report.request_count);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_check(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let mut client = open_client(&paths)?;

    let report = check_links(&mut client, &paths.config.collation_locale())?;

    println!("check");
    println!("pages: {}", report.pages);
    println!("links: {}", report.links);
    println!("broken: {}", report.broken.len());
    for link in &report.broken {
        println!("broken.link: {} -> {}", link.source, link.target);
        println!("  line: {}", link.line);
        for suggestion in &link.suggestions {
            println!("  suggestion: {suggestion}");
        }
    }
    println!("request_count: {}", report.request_count);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn print_reconcile_report(report: &ReconcileReport) {
    println!(
        "mode: {}",
        match report.mode {
            RunMode::Bootstrap => "bootstrap",
            RunMode::Resume => "resume",
        }
    );
    println!("pages: {}", report.pages);
    println!("transitions: {}", report.transitions);
    println!("transitions.created: {}", report.created);
    println!("transitions.edited: {}", report.edits);
    println!("transitions.metadata_edited: {}", report.metadata_edits);
    println!("transitions.moved: {}", report.moves);
    println!("transitions.ghost: {}", report.ghosts);
    println!("commits: {}", report.commits);
    println!("already_applied: {}", report.already_applied);
    println!(
        "previous_watermark: {}",
        report
            .previous_watermark
            .map(|date| date.to_rfc3339())
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!(
        "watermark: {}",
        report
            .watermark
            .map(|date| date.to_rfc3339())
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("pruned_directories: {}", report.pruned_directories);
    for file in &report.missing_files {
        println!("missing_file: {}", normalize_path(file));
    }
}

fn open_client(paths: &ResolvedPaths) -> Result<WikiJsClient> {
    let config = WikiJsClientConfig::from_config(&paths.config);
    if config.api_url.trim().is_empty() {
        bail!(
            "no Wiki.js URL configured: set [wiki].api_url in {} or WIKIJS_API_URL",
            normalize_path(&paths.config_path)
        );
    }
    WikiJsClient::new(config)
}

fn open_git(paths: &ResolvedPaths) -> GitCli {
    GitCli::new(
        paths.config.git_binary(),
        &paths.mirror_root,
        paths.config.committer(),
    )
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        mirror_root: runtime.mirror_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
