//! casnap CLI: back up, restore, verify, and clean a content-addressed
//! repository.

use clap::Parser;

use casnap::engine::{
    Cli, Commands, handle_backup, handle_cleanup, handle_restore, handle_verify,
};

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Backup {
            common,
            index,
            root,
            one_file_system,
            preserve_atime,
            exclude,
            overwrite,
            hints,
        } => handle_backup(
            &common,
            index,
            root,
            one_file_system,
            preserve_atime,
            exclude,
            overwrite,
            hints,
        ),
        Commands::Restore {
            common,
            index,
            root,
            no_permissions,
        } => handle_restore(&common, index, root, no_permissions),
        Commands::Verify {
            common,
            index,
            detect_bogus,
        } => handle_verify(&common, index, detect_bogus),
        Commands::Cleanup {
            common,
            delete,
            detect_bogus,
            indexes,
        } => handle_cleanup(&common, delete, detect_bogus, &indexes),
    };

    match result {
        Ok(0) => {}
        Ok(_) => std::process::exit(1),
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            std::process::exit(1);
        }
    }
}
