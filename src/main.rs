use chrono::{Duration, Utc};
use std::env;
use std::process;

use stagemon_service::collector;
use stagemon_service::config::{self, ServiceConfig, SiteConfig, DEFAULT_CONFIG_PATH};
use stagemon_service::db;
use stagemon_service::engine::{DecisionEngine, Sources, StageRequest};
use stagemon_service::ingest;
use stagemon_service::logging::{self, DataSource};
use stagemon_service::model::{Group, GroupInput, Level, Site, StageRecord};
use stagemon_service::store::{
    IncidentSource, MemoryStore, ReadingStore, SnapshotStore, StageHistory, StationStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    CollectWeather,
    CollectMobility,
    Classify,
    History,
    Status,
}

#[derive(Debug, Clone, PartialEq)]
struct Options {
    command: Command,
    config_path: String,
    site: Option<String>,
    memory: bool,
    meteo: Option<i64>,
    incidents: Option<i64>,
    mobility: Option<i64>,
    events: Option<i64>,
    user: Option<String>,
    hours: i64,
    level: Option<i64>,
    limit: usize,
}

fn print_help() {
    println!("Usage: stagemon <command> [options]");
    println!();
    println!("Commands:");
    println!("  collect-weather     fetch current Open-Meteo conditions for every active site");
    println!("  collect-mobility    fetch the traffic feed for every active site");
    println!("  classify            compute and record the city's operational stage");
    println!("  history             list recorded stages");
    println!("  status              latest stage and statistics");
    println!();
    println!("Options:");
    println!("  --config <path>     configuration file (default {})", DEFAULT_CONFIG_PATH);
    println!("  --site <id>         site to classify (default: first active site)");
    println!("  --memory            use an in-memory store instead of PostgreSQL");
    println!("  --meteo <1-5>       provide the meteorology level instead of computing it");
    println!("  --incidents <1-5>   provide the incidents level");
    println!("  --mobility <1-5>    provide the mobility level");
    println!("  --events <1-5>      provide the events level (absent otherwise)");
    println!("  --user <name>       who requested the classification");
    println!("  --hours <n>         look-back for history and status (default 24)");
    println!("  --level <1-5>       history: only records at this level");
    println!("  --limit <n>         history: maximum records (default 20)");
}

fn parse_options<'a, I>(args: I) -> Result<Options, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut args = args.into_iter();
    let command = match args.next() {
        Some("collect-weather") => Command::CollectWeather,
        Some("collect-mobility") => Command::CollectMobility,
        Some("classify") => Command::Classify,
        Some("history") => Command::History,
        Some("status") => Command::Status,
        Some(other) => return Err(format!("unknown command: {}", other)),
        None => return Err("missing command".to_string()),
    };

    let mut options = Options {
        command,
        config_path: DEFAULT_CONFIG_PATH.to_string(),
        site: None,
        memory: false,
        meteo: None,
        incidents: None,
        mobility: None,
        events: None,
        user: None,
        hours: 24,
        level: None,
        limit: 20,
    };

    while let Some(arg) = args.next() {
        let mut value = |name: &str| -> Result<String, String> {
            args.next()
                .map(str::to_string)
                .ok_or_else(|| format!("{} requires a value", name))
        };
        match arg {
            "--config" => options.config_path = value(arg)?,
            "--site" => options.site = Some(value(arg)?),
            "--memory" => options.memory = true,
            "--meteo" => options.meteo = Some(parse_number(arg, &value(arg)?)?),
            "--incidents" => options.incidents = Some(parse_number(arg, &value(arg)?)?),
            "--mobility" => options.mobility = Some(parse_number(arg, &value(arg)?)?),
            "--events" => options.events = Some(parse_number(arg, &value(arg)?)?),
            "--user" => options.user = Some(value(arg)?),
            "--hours" => options.hours = parse_number(arg, &value(arg)?)?.max(1),
            "--level" => options.level = Some(parse_number(arg, &value(arg)?)?),
            "--limit" => options.limit = parse_number(arg, &value(arg)?)?.max(1) as usize,
            other => return Err(format!("unknown option: {}", other)),
        }
    }
    Ok(options)
}

fn parse_number(name: &str, raw: &str) -> Result<i64, String> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| format!("{} expects an integer, got '{}'", name, raw))
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let options = match parse_options(args.iter().skip(1).map(|arg| arg.as_str())) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{}", err);
            print_help();
            process::exit(2);
        }
    };

    let config = match config::load_config(&options.config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    let min_level = match config.service.min_log_level() {
        Ok(level) => level,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };
    logging::init_logger(min_level, config.service.log_file.as_deref(), config.service.console_timestamps);

    let result = if options.memory {
        run(&MemoryStore::new(), &config, &options)
    } else {
        match db::connect_from_env(&config.service.database_url_env) {
            Ok(store) => run(&store, &config, &options),
            Err(err) => Err(err.to_string()),
        }
    };

    if let Err(err) = result {
        logging::error(DataSource::System, options.site.as_deref(), &err);
        process::exit(1);
    }
}

fn run<S>(store: &S, config: &ServiceConfig, options: &Options) -> Result<(), String>
where
    S: StationStore + ReadingStore + SnapshotStore + IncidentSource + StageHistory,
{
    let sites: Vec<&SiteConfig> = match options.site.as_deref() {
        Some(id) => vec![config.site(id).ok_or_else(|| format!("unknown site '{}'", id))?],
        None => config.active_sites().collect(),
    };
    for site in &sites {
        seed_stations(store, site)?;
    }
    let site_list: Vec<Site> = sites.iter().map(|s| s.site()).collect();

    match options.command {
        Command::CollectWeather => {
            let client = ingest::build_client(config.providers.weather_timeout_secs).map_err(|e| e.to_string())?;
            let report = collector::weather_cycle(&client, &config.providers.open_meteo_url, &site_list, store, store);
            println!("weather: {}/{} sites collected", report.successful, report.total);
        }
        Command::CollectMobility => {
            let client = ingest::build_client(config.providers.traffic_timeout_secs).map_err(|e| e.to_string())?;
            let report = collector::mobility_cycle(&client, &config.providers.waze_url, &site_list, store, Utc::now());
            println!("mobility: {}/{} sites collected", report.successful, report.total);
        }
        Command::Classify => {
            let engine = DecisionEngine::new(config, Sources::from_store(store));
            let mut request = match site_list.first() {
                Some(site) => StageRequest::computed(&site.id),
                None => StageRequest { site_id: None, ..StageRequest::computed("") },
            };
            let inputs = [
                (Group::Meteorology, options.meteo),
                (Group::Incidents, options.incidents),
                (Group::Mobility, options.mobility),
                (Group::Events, options.events),
            ];
            for (group, raw) in inputs {
                let current = request.input(group);
                request = request.with_input(group, GroupInput::from_raw(raw, current));
            }
            if let Some(user) = options.user.as_deref() {
                request = request.requested_by(user);
            }
            let record = engine.classify(&request, Utc::now()).map_err(|e| e.to_string())?;
            print_record(&record);
        }
        Command::History => {
            let engine = DecisionEngine::new(config, Sources::from_store(store));
            let records = match options.level {
                Some(level) => engine.by_level(Level::clamped(level), options.limit),
                None => engine.history(Utc::now() - Duration::hours(options.hours), options.limit),
            }
            .map_err(|e| e.to_string())?;
            if records.is_empty() {
                println!("no records");
            }
            for record in &records {
                println!(
                    "#{:<6} {}  {}  mean {:.3}  {}",
                    record.id.unwrap_or_default(),
                    record.computed_at.format("%Y-%m-%d %H:%M UTC"),
                    record.level,
                    record.combined_level,
                    record.requested_by.as_deref().unwrap_or("system")
                );
            }
        }
        Command::Status => {
            let engine = DecisionEngine::new(config, Sources::from_store(store));
            match engine.latest().map_err(|e| e.to_string())? {
                Some(record) => print_record(&record),
                None => println!("no stage recorded yet"),
            }
            let stats = engine
                .statistics(Utc::now() - Duration::hours(options.hours))
                .map_err(|e| e.to_string())?;
            println!();
            println!("last {}h: {} record(s)", options.hours, stats.count);
            if let (Some(mean), Some(min), Some(max)) = (stats.mean_level, stats.min_level, stats.max_level) {
                println!("  mean {:.2}, min {}, max {}", mean, min.value(), max.value());
            }
        }
    }
    Ok(())
}

/// Registers configured stations the store does not know yet. Existing rows
/// are left alone so a principal chosen at runtime survives restarts.
fn seed_stations(store: &dyn StationStore, site: &SiteConfig) -> Result<(), String> {
    let known = store.stations_for_site(&site.id).map_err(|e| e.to_string())?;
    for station in site.stations() {
        if known.iter().any(|k| k.code == station.code) {
            continue;
        }
        store.upsert_station(&station).map_err(|e| e.to_string())?;
        logging::debug(DataSource::Database, Some(&site.id), &format!("Registered station {}", station.code));
    }
    Ok(())
}

fn print_record(record: &StageRecord) {
    println!(
        "Stage {} - mean {:.3}, proximity {:.1}% (record #{}, {})",
        record.level,
        record.combined_level,
        record.proximity * 100.0,
        record.id.unwrap_or_default(),
        record.computed_at.format("%Y-%m-%d %H:%M UTC")
    );
    println!();
    println!("{}", record.justification.text);
    if !record.actions.is_empty() {
        println!();
        for action in &record.actions {
            let deadline = action
                .deadline_hours
                .map(|h| format!(" (within {}h)", h))
                .unwrap_or_default();
            println!("  [{}] {}{}", action.order, action.title, deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_classify_with_overrides() {
        let options = parse_options(["classify", "--meteo", "4", "--user", "ops", "--memory"]).unwrap();
        assert_eq!(options.command, Command::Classify);
        assert_eq!(options.meteo, Some(4));
        assert_eq!(options.incidents, None);
        assert_eq!(options.user.as_deref(), Some("ops"));
        assert!(options.memory);
        assert_eq!(options.config_path, DEFAULT_CONFIG_PATH);
    }

    #[test]
    fn test_parse_rejects_unknown_and_incomplete() {
        assert!(parse_options(["launch"]).is_err());
        assert!(parse_options(Vec::<&str>::new()).is_err());
        assert!(parse_options(["classify", "--meteo"]).is_err());
        assert!(parse_options(["classify", "--meteo", "high"]).is_err());
        assert!(parse_options(["status", "--verbose"]).is_err());
    }

    #[test]
    fn test_history_defaults() {
        let options = parse_options(["history", "--hours", "0"]).unwrap();
        assert_eq!(options.hours, 1);
        assert_eq!(options.limit, 20);
        assert_eq!(options.level, None);
    }
}
