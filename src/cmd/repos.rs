//! Repository registry commands.

use anyhow::{Context, Result};

use repopilot::config::Settings;
use repopilot::git::Git;
use repopilot::models::{RepoConfig, RepoPatch};
use repopilot::registry;

use super::{open_store, print_json};
use crate::RepoCommands;

fn print_repos(repos: &[RepoConfig]) {
    if repos.is_empty() {
        println!("No repositories registered. Run 'repopilot repo rescan' or 'repopilot repo add <path>'.");
        return;
    }
    println!(
        "{:<20} {:<8} {:<10} {:<24} Path",
        "Id", "Enabled", "Branch", "Remote"
    );
    println!(
        "{:<20} {:<8} {:<10} {:<24} ----",
        "--------------------", "-------", "---------", "-----------------------"
    );
    for repo in repos {
        println!(
            "{:<20} {:<8} {:<10} {:<24} {}",
            repo.id,
            if repo.enabled { "yes" } else { "no" },
            repo.main_branch,
            repo.remote().unwrap_or("-"),
            repo.root_path.display()
        );
    }
}

pub async fn cmd_repo(settings: &Settings, json: bool, command: RepoCommands) -> Result<()> {
    let store = open_store(settings)?;
    let git = Git::new(&settings.git_cmd);

    match command {
        RepoCommands::List => {
            let repos = store.blocking().list_repos()?;
            if json {
                return print_json(&repos);
            }
            print_repos(&repos);
        }
        RepoCommands::Rescan => {
            let repos = registry::rescan(&store, &git, &settings.repos_dir).await?;
            if json {
                return print_json(&repos);
            }
            println!("Scanned {}", settings.repos_dir.display());
            print_repos(&repos);
        }
        RepoCommands::Add { path } => {
            let repo = registry::add_repo(&store, &git, &path).await?;
            if json {
                return print_json(&repo);
            }
            println!("Registered {} ({})", repo.id, repo.root_path.display());
        }
        RepoCommands::Set {
            id,
            enabled,
            test_command,
            main_branch,
            github_repo,
        } => {
            let patch = RepoPatch {
                enabled,
                test_command,
                main_branch,
                github_repo,
            };
            let repo = store
                .blocking()
                .patch_repo(&id, patch)
                .with_context(|| format!("Failed to update repository {id}"))?;
            if json {
                return print_json(&repo);
            }
            print_repos(std::slice::from_ref(&repo));
        }
    }
    Ok(())
}
