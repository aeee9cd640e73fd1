use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::api::Gateway;
use crate::client::Client;
use crate::config;
use crate::credentials::CredentialStore;
use crate::models::{NearbyQuery, PageRequest, RegisterRequest};
use crate::storage::{self, ThemePreference};

pub const USAGE: &str = "ALRIS - report and track civic issues from the terminal.

Usage: alris <command> [args]

Commands:
  login [--authority] <email> <password>   Sign in and store credentials
  register <name> <email> <password>       Create a citizen account
  logout                                   Forget stored credentials
  status                                   Show sign-in state and preferences
  nearby <lat> <lng> [radius_km]           List issues near a location
  issue <id>                               Show one issue
  notifications                            List notifications
  read-all                                 Mark every notification as read
  theme [system|light|dark]                Show or set the theme preference

Flags:
  --version, -V                            Show version and exit
  --help,    -h                            Show this help message";

pub fn run(args: &[String]) -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let store = Arc::new(
        storage::Store::open(storage::Options {
            path: cfg.storage.path.clone(),
        })
        .context("open storage")?,
    );

    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        [] => {
            println!("{}", USAGE);
            Ok(())
        }
        ["status"] => status(&store),
        ["theme"] => {
            println!("{}", store.theme()?.as_str());
            Ok(())
        }
        ["theme", value] => {
            let theme = ThemePreference::parse(value)
                .with_context(|| format!("unknown theme {:?}", value))?;
            store.set_theme(theme)?;
            println!("{}", theme.as_str());
            Ok(())
        }
        ["logout"] => {
            store.clear()?;
            println!("Signed out.");
            Ok(())
        }
        rest => {
            let client = Client::new(store.clone(), cfg.api.client_config())
                .context("build api client")?;
            let gateway = Gateway::new(Arc::new(client));
            remote(&gateway, rest)
        }
    }
}

fn status(store: &storage::Store) -> Result<()> {
    let creds = store.read()?;
    if creds.is_authenticated() {
        println!("Signed in.");
    } else {
        println!("Signed out.");
    }
    println!("Theme: {}", store.theme()?.as_str());
    Ok(())
}

fn remote(gateway: &Gateway, args: &[&str]) -> Result<()> {
    match args {
        ["login", "--authority", email, password] => {
            let session = gateway.login_authority(email, password)?;
            println!("Signed in as {} ({})", session.user.name, session.user.role);
        }
        ["login", email, password] => {
            let session = gateway.login(email, password)?;
            println!("Signed in as {} ({})", session.user.name, session.user.role);
        }
        ["register", name, email, password] => {
            let session = gateway.register(&RegisterRequest {
                name: name.to_string(),
                email: email.to_string(),
                password: password.to_string(),
                phone: None,
            })?;
            println!("Registered {} ({})", session.user.name, session.user.email);
        }
        ["nearby", lat, lng, rest @ ..] => {
            let radius_km = match rest {
                [] => None,
                [radius] => Some(radius.parse::<f64>().context("parse radius")?),
                _ => bail!("usage: alris nearby <lat> <lng> [radius_km]"),
            };
            let query = NearbyQuery {
                latitude: lat.parse().context("parse latitude")?,
                longitude: lng.parse().context("parse longitude")?,
                radius_km,
                page: PageRequest::default(),
            };
            let page = gateway.nearby_issues(&query)?;
            for issue in &page.items {
                let distance = issue
                    .distance_km
                    .map(|d| format!("{:.1} km", d))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<12} {:<10} {:<12} {:>8}  {}",
                    issue.id,
                    issue.category.as_str(),
                    issue.status,
                    distance,
                    issue.title
                );
            }
            println!("{} of {} issues", page.items.len(), page.total);
        }
        ["issue", id] => {
            let issue = gateway.issue(id)?;
            println!("{} [{}] {}", issue.id, issue.status, issue.title);
            println!("Category: {}", issue.category.as_str());
            println!("Location: {:.5}, {:.5}", issue.latitude, issue.longitude);
            if let Some(address) = &issue.address {
                println!("Address: {}", address);
            }
            if !issue.description.is_empty() {
                println!("\n{}", issue.description);
            }
        }
        ["notifications"] => {
            let page = gateway.notifications(PageRequest::default())?;
            for note in &page.items {
                let marker = if note.read { " " } else { "*" };
                println!("{} {:<12} {}", marker, note.id, note.title);
            }
            if page.items.is_empty() {
                println!("No notifications.");
            }
        }
        ["read-all"] => {
            gateway.mark_all_notifications_read()?;
            println!("All notifications marked as read.");
        }
        other => bail!("unknown command {:?}\n\n{}", other.join(" "), USAGE),
    }
    Ok(())
}
