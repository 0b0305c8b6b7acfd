use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use scope_registry::{
    InMemoryRegistry, Interests, RegistryClient, ResourceRegistry, Telescope, TelescopeList,
    TelescopeRequest,
};
use scope_session::SessionMode;
use tracing::info;

use crate::cli::Commands;
use crate::config::{AppConfig, BackendKind};
use crate::session;

/// The telescope backend the console talks to.
pub enum Backend {
    Http(Arc<RegistryClient>),
    Memory(Arc<InMemoryRegistry>),
}

impl Backend {
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        match cfg.backend {
            BackendKind::Http => {
                let client = RegistryClient::with_timeout(&cfg.backend_url, cfg.request_timeout())
                    .with_context(|| format!("invalid backend url {}", cfg.backend_url))?;
                Ok(Backend::Http(Arc::new(client)))
            }
            BackendKind::Memory => {
                info!("using the in-memory demo registry");
                Ok(Backend::Memory(InMemoryRegistry::demo()))
            }
        }
    }

    pub fn registry(&self) -> Arc<dyn ResourceRegistry> {
        match self {
            Backend::Http(client) => client.clone(),
            Backend::Memory(registry) => registry.clone(),
        }
    }

    fn admin(&self) -> anyhow::Result<&RegistryClient> {
        match self {
            Backend::Http(client) => Ok(client),
            Backend::Memory(_) => bail!("telescope administration needs the http backend"),
        }
    }
}

pub async fn run(command: Commands, cfg: &AppConfig, backend: &Backend) -> anyhow::Result<()> {
    let registry = backend.registry();
    match command {
        Commands::List => {
            let listing = registry.list().await.context("failed to list telescopes")?;
            print!("{}", format_listing(&listing));
        }
        Commands::Details { telescope_id } => {
            let specifications = registry
                .details(&telescope_id)
                .await
                .with_context(|| format!("failed to fetch details of {telescope_id}"))?;
            println!("{}", serde_json::to_string_pretty(&specifications)?);
        }
        Commands::View { telescope_id } => {
            session::run(cfg, registry, &telescope_id, SessionMode::View).await?;
        }
        Commands::Control { telescope_id } => {
            session::run(cfg, registry, &telescope_id, SessionMode::Control).await?;
        }
        Commands::SetStatus {
            telescope_id,
            status,
        } => {
            let response = registry
                .set_status(&cfg.holder_id, &telescope_id, status)
                .await
                .with_context(|| format!("failed to set {telescope_id} to {status}"))?;
            if response.subscribe_token.is_empty() {
                println!("{telescope_id} is now {status}");
            } else {
                println!(
                    "{telescope_id} is now {status}; session token {}",
                    response.subscribe_token
                );
            }
        }
        Commands::Interests {
            telescope_id,
            topics,
        } => {
            let interests = Interests {
                interesting: topics,
            };
            registry
                .publish_interests(&telescope_id, &interests)
                .await
                .with_context(|| format!("failed to publish interests for {telescope_id}"))?;
            println!("published {} interest(s)", interests.interesting.len());
        }
        Commands::Register { file } => {
            let request = read_request(&file)?;
            let created = backend.admin()?.create_telescope(&request).await?;
            println!(
                "registered {} (publish token {})",
                created.telescope_id, created.publish_token
            );
        }
        Commands::Update { telescope_id, file } => {
            let request = read_request(&file)?;
            let updated = backend
                .admin()?
                .update_telescope(&telescope_id, &request)
                .await?;
            println!("updated {}", updated.telescope_id);
        }
        Commands::Remove { telescope_id } => {
            backend.admin()?.delete_telescope(&telescope_id).await?;
            println!("removed {telescope_id}");
        }
    }
    Ok(())
}

fn read_request(path: &Path) -> anyhow::Result<TelescopeRequest> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("invalid telescope in {}", path.display()))
}

fn format_listing(listing: &TelescopeList) -> String {
    let mut out = format!(
        "{} available, {} reserved, {} unavailable\n",
        listing.available_telescopes, listing.reserved_telescopes, listing.unavailable_telescopes
    );
    for telescope in &listing.telescopes {
        out.push_str(&format_row(telescope));
        out.push('\n');
    }
    out
}

fn format_row(telescope: &Telescope) -> String {
    let place = match (&telescope.location.city, &telescope.location.country) {
        (Some(city), Some(country)) => format!("{city}, {country}"),
        (Some(place), None) | (None, Some(place)) => place.clone(),
        (None, None) => format!(
            "{:.4}, {:.4}",
            telescope.location.latitude, telescope.location.longitude
        ),
    };
    format!(
        "{:<8} {:<8} {:>6.2}/min  {}  ({place})",
        telescope.telescope_id,
        telescope.status.as_path_segment(),
        telescope.price_per_minute,
        telescope.telescope_name,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use scope_registry::{Location, TelescopeStatus};

    fn telescope(id: &str, status: TelescopeStatus, city: Option<&str>) -> Telescope {
        Telescope {
            telescope_id: id.to_string(),
            telescope_name: format!("Scope {id}"),
            price_per_minute: 0.5,
            location: Location {
                city: city.map(str::to_string),
                country: None,
                latitude: 50.0,
                longitude: 19.9,
            },
            status,
        }
    }

    #[test]
    fn listing_leads_with_counters() {
        let listing = TelescopeList::from_telescopes(vec![
            telescope("T1", TelescopeStatus::Free, Some("Kraków")),
            telescope("T2", TelescopeStatus::Locked, None),
        ]);
        let text = format_listing(&listing);
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("1 available, 1 reserved, 0 unavailable"));
        let first = lines.next().expect("row for T1");
        assert!(first.starts_with("T1"));
        assert!(first.contains("FREE"));
        assert!(first.contains("0.50/min"));
        assert!(first.ends_with("(Kraków)"));
        let second = lines.next().expect("row for T2");
        assert!(second.contains("LOCK"));
        assert!(second.ends_with("(50.0000, 19.9000)"));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn administration_needs_the_http_backend() {
        let backend = Backend::Memory(InMemoryRegistry::demo());
        let result = run(
            Commands::Remove {
                telescope_id: "T1".into(),
            },
            &AppConfig::default(),
            &backend,
        )
        .await;
        assert!(result.is_err());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn set_status_goes_through_the_registry() {
        let registry = InMemoryRegistry::demo();
        let backend = Backend::Memory(registry.clone());
        run(
            Commands::SetStatus {
                telescope_id: "T1".into(),
                status: TelescopeStatus::Locked,
            },
            &AppConfig::default(),
            &backend,
        )
        .await
        .expect("lock accepted");
        assert_eq!(registry.status_of("T1"), Some(TelescopeStatus::Locked));
        assert_eq!(registry.holder_of("T1").as_deref(), Some("1"));
    }
}
