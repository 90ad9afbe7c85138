//! Gauge tracking admin CLI
//!
//! Operational access to the pairing engine and calibration workflow.
//!
//! ## Usage
//!
//! ```bash
//! DATABASE_URL=postgresql://localhost/gauge-track cargo run --bin gauge_admin -- verify-schema
//!
//! gauge_admin register <serial> <category> [thread_size thread_class]
//! gauge_admin pair <category> <serial_a> <serial_b> [location]
//! gauge_admin unpair <set_code>
//! gauge_admin replace <set_code> <outgoing_serial> <incoming_serial>
//! gauge_admin send <identifier> [identifier ...]
//! gauge_admin returned <identifier>
//! gauge_admin cert <identifier> <file_ref>
//! gauge_admin release <set_code> <destination>
//! gauge_admin show <set_code>
//! gauge_admin retire <serial>
//! ```

use anyhow::{anyhow, Context, Result};

use gauge_track::{
    CreateSetRequest, DatabaseConfig, DatabaseManager, GaugeCategory, GaugeSpec,
    GaugeTrackService, LockConfig, NewGauge, ReplaceRequest, SharedAttributes, UnpairRequest,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("help");

    if command == "help" {
        print_usage();
        return Ok(());
    }

    let manager = DatabaseManager::new(DatabaseConfig::default())
        .await
        .context("database connection failed")?;

    if command == "verify-schema" {
        manager.verify_schema().await?;
        println!("gauge schema OK");
        return Ok(());
    }

    manager.verify_schema().await?;
    let service = GaugeTrackService::new(manager.pool().clone(), LockConfig::default());
    let actor = std::env::var("GAUGE_ACTOR").unwrap_or_else(|_| "gauge_admin".to_string());

    match command {
        "register" => {
            let serial = arg(&args, 1, "serial")?;
            let category = parse_category(&arg(&args, 2, "category")?)?;
            let spec = match category {
                GaugeCategory::ThreadPlug => GaugeSpec::thread(
                    &arg(&args, 3, "thread_size")?,
                    &arg(&args, 4, "thread_class")?,
                ),
                GaugeCategory::PlainPlug => GaugeSpec {
                    category,
                    thread_size: None,
                    thread_class: None,
                },
            };
            let gauge = service
                .register_spare(
                    NewGauge {
                        serial_number: serial,
                        spec,
                        storage_location: args.get(5).cloned(),
                    },
                    &actor,
                )
                .await?;
            println!("registered spare {} ({})", gauge.serial_number, gauge.internal_key);
        }
        "pair" => {
            let created = service
                .create_set(CreateSetRequest {
                    category: parse_category(&arg(&args, 1, "category")?)?,
                    serial_a: arg(&args, 2, "serial_a")?,
                    serial_b: arg(&args, 3, "serial_b")?,
                    attributes: SharedAttributes {
                        storage_location: args.get(4).cloned(),
                    },
                    actor: actor.clone(),
                })
                .await?;
            println!(
                "created set {}: GO={} NO-GO={}",
                created.set_code,
                created.member_a.full_identifier(),
                created.member_b.full_identifier()
            );
        }
        "unpair" => {
            let unpaired = service
                .unpair_set(UnpairRequest {
                    set_code: arg(&args, 1, "set_code")?,
                    actor: actor.clone(),
                })
                .await?;
            println!(
                "unpaired {}: freed serials {} and {}",
                unpaired.set_code, unpaired.freed_serials[0], unpaired.freed_serials[1]
            );
        }
        "replace" => {
            let replaced = service
                .replace_in_set(ReplaceRequest {
                    set_code: arg(&args, 1, "set_code")?,
                    outgoing_serial: arg(&args, 2, "outgoing_serial")?,
                    incoming_serial: arg(&args, 3, "incoming_serial")?,
                    actor: actor.clone(),
                })
                .await?;
            println!(
                "set {}: {} in, {} freed",
                replaced.set_code,
                replaced.incoming.full_identifier(),
                replaced.freed_serial
            );
        }
        "send" => {
            let identifiers: Vec<String> = args[1..].to_vec();
            let result = service.send_to_calibration(&identifiers, &actor).await?;
            for change in result.updated {
                println!("{}: {} -> {}", change.identifier, change.from, change.to);
            }
        }
        "returned" => {
            let change = service
                .mark_returned(&arg(&args, 1, "identifier")?, &actor)
                .await?;
            println!("{}: {} -> {}", change.identifier, change.from, change.to);
        }
        "cert" => {
            let attached = service
                .upload_certificate(
                    &arg(&args, 1, "identifier")?,
                    &arg(&args, 2, "file_ref")?,
                    &actor,
                )
                .await?;
            println!(
                "{}: certificate {} attached, status {}{}",
                attached.identifier,
                attached.certificate_id,
                attached.status,
                if attached.set_ready_for_release {
                    " (set ready for release)"
                } else {
                    " (waiting on companion certificate)"
                }
            );
        }
        "release" => {
            let released = service
                .release_set(
                    &arg(&args, 1, "set_code")?,
                    &arg(&args, 2, "destination")?,
                    &actor,
                )
                .await?;
            println!(
                "released {} to {}",
                released.set_code, released.storage_location
            );
        }
        "show" => {
            let members = service.get_set_members(&arg(&args, 1, "set_code")?).await?;
            for member in members {
                println!(
                    "{}  serial={}  status={}  location={}",
                    member.full_identifier(),
                    member.serial_number,
                    member.status,
                    member.storage_location.as_deref().unwrap_or("-")
                );
            }
        }
        "retire" => {
            let retired = service.retire_gauge(&arg(&args, 1, "serial")?, &actor).await?;
            println!("retired {}", retired.serial_number);
        }
        other => {
            print_usage();
            return Err(anyhow!("unknown command '{other}'"));
        }
    }

    Ok(())
}

fn arg(args: &[String], index: usize, name: &str) -> Result<String> {
    args.get(index)
        .cloned()
        .ok_or_else(|| anyhow!("missing argument <{name}>"))
}

fn parse_category(raw: &str) -> Result<GaugeCategory> {
    GaugeCategory::from_db_str(&raw.to_ascii_uppercase())
        .ok_or_else(|| anyhow!("unknown category '{raw}' (THREAD_PLUG or PLAIN_PLUG)"))
}

fn print_usage() {
    println!("gauge_admin commands:");
    println!("  verify-schema");
    println!("  register <serial> <category> [thread_size thread_class] [location]");
    println!("  pair <category> <serial_a> <serial_b> [location]");
    println!("  unpair <set_code>");
    println!("  replace <set_code> <outgoing_serial> <incoming_serial>");
    println!("  send <identifier> [identifier ...]");
    println!("  returned <identifier>");
    println!("  cert <identifier> <file_ref>");
    println!("  release <set_code> <destination>");
    println!("  show <set_code>");
    println!("  retire <serial>");
}
