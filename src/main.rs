use anyhow::{bail, Result};
use clap::Parser;
use tracing::error;

use scenedup::cli::Args;
use scenedup::database::Store;
use scenedup::services::import::{self, ImportOptions, StopToken, MIN_FILE_AGE};
use scenedup::services::{maintain, search};

fn main() {
    let args = Args::parse();
    scenedup::logging::init();
    import::set_process_nice(args.nice);

    if let Err(e) = run(&args) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    // Resolve the backend up front so a typo fails before any work starts.
    let backend = args.backend()?;
    if args.indexlength == 0 {
        bail!("--indexlength must be positive");
    }
    if args.ui && !args.search && args.searchres.is_none() {
        bail!("--ui needs --search or --searchres");
    }
    if args.fixrenames && args.dir.is_none() {
        bail!("--fixrenames needs --dir");
    }

    let mut store = Store::open(&args.db_path())?;
    let token = StopToken::new();
    token.install_sighup();

    let mut acted = false;

    if let Some(pair) = &args.rename {
        maintain::rename(&mut store, &pair[0], &pair[1])?;
        acted = true;
    }

    if !args.whitelist.is_empty() {
        maintain::whitelist_paths(&mut store, &args.whitelist)?;
        acted = true;
    }

    if args.purge || args.delete {
        maintain::purge(&mut store, args.delete)?;
        acted = true;
    }

    if args.fixrenames {
        if let Some(dir) = &args.dir {
            let fixed = maintain::fix_moved(&mut store, dir, &args.extensions())?;
            tracing::info!("updated {fixed} moved file(s)");
        }
        acted = true;
    } else if args.dir.is_some() || args.file.is_some() {
        let mut paths = Vec::new();
        if let Some(dir) = &args.dir {
            paths.extend(import::collect_dir(dir, &args.extensions(), MIN_FILE_AGE));
        }
        if let Some(pattern) = &args.file {
            paths.extend(import::collect_glob(pattern)?);
        }
        let opts = ImportOptions {
            refresh: args.refresh,
            repair: args.repair,
        };
        let imported = import::import_files(&mut store, &paths, &opts, &token)?;
        tracing::info!("imported {imported} of {} candidate file(s)", paths.len());
        acted = true;
    }

    if args.migrate {
        let rehashed = maintain::migrate(&mut store)?;
        tracing::info!("rehashed {rehashed} file(s)");
        acted = true;
    }

    if args.search {
        let opts = search::SearchOptions {
            windows: args.window_params(),
            backend,
            radius: args.radius,
            step: args.step,
        };
        let groups = search::run(&store, &opts)?;

        if let Some(path) = &args.searchres {
            search::save_results(path, &groups)?;
        }
        search::print_report(&groups);
        if args.ui {
            let resfile = match &args.searchres {
                Some(path) => path.clone(),
                None => {
                    let path = std::env::temp_dir().join("scenedup-results.json");
                    search::save_results(&path, &groups)?;
                    path
                }
            };
            search::launch_review_ui(&resfile);
        }
        acted = true;
    } else if let Some(resfile) = &args.searchres {
        // Read-back mode: re-filter a stored result set and report it.
        let groups = search::filter_stale(&store, search::load_results(resfile)?)?;
        search::print_report(&groups);
        if args.ui {
            search::launch_review_ui(resfile);
        }
        acted = true;
    }

    if !acted {
        bail!("nothing to do, see --help");
    }
    Ok(())
}
