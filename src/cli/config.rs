use crate::config::generate::{generate_sample_pipeline, generate_starter_config};
use crate::config::{parse_config, GlobalConfig, RuntimeSettings};
use crate::pipeline::PipelineConfig;
use crate::plugin::{ContractVersion, PluginKind, PluginRegistry};
use std::fs;
use std::path::{Path, PathBuf};

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Try to write to ~/.config/logferry/config.yml first
    let config_path = dirs::home_dir()
        .map(|home| home.join(".config/logferry/config.yml"))
        .filter(|path| match path.parent() {
            Some(parent) => match fs::create_dir_all(parent) {
                Ok(_) => true,
                Err(_) => {
                    eprintln!("Warning: Could not create directory {}", parent.display());
                    eprintln!("Falling back to /etc/logferry/config.yml");
                    false
                }
            },
            None => false,
        })
        .unwrap_or_else(|| PathBuf::from("/etc/logferry/config.yml"));

    if config_path.exists() {
        eprintln!(
            "Error: Config file already exists at {}",
            config_path.display()
        );
        eprintln!("Remove it first or use --stdout to print the config");
        std::process::exit(1);
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config_path, &config_content)?;
    println!("Config file written to {}", config_path.display());

    // Drop a sample pipeline next to it so `run` has something to do.
    let config = parse_config(&config_content)?;
    if let Some(dir) = config.pipelines.dir {
        fs::create_dir_all(&dir)?;
        let sample = dir.join("sample.json");
        if !sample.exists() {
            fs::write(&sample, generate_sample_pipeline())?;
            println!("Sample pipeline written to {}", sample.display());
        }
    }
    Ok(())
}

/// Outcome of validating one pipeline document.
#[derive(Debug)]
pub struct CheckReport {
    pub name: String,
    pub version: ContractVersion,
    pub detail_hash: String,
    pub plugins: Vec<String>,
    pub problems: Vec<String>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Parse a document and resolve every plugin type against `registry`
/// without starting anything.
pub fn check_document(
    registry: &PluginRegistry,
    defaults: &GlobalConfig,
    runtime: &RuntimeSettings,
    name: &str,
    text: &str,
) -> Result<CheckReport, crate::pipeline::PipelineError> {
    let config = PipelineConfig::parse("", name, name, text)?;
    let factory = crate::pipeline::PipelineFactory::new(
        registry.clone(),
        std::sync::Arc::new(crate::checkpoint::CheckpointStore::new()),
        defaults.clone(),
        runtime.clone(),
    );
    let global = factory.resolve_global(&config.document)?;
    let version = ContractVersion::parse(&global.structure_type)
        .ok_or_else(|| crate::pipeline::PipelineError::VersionMismatch(global.structure_type.clone()))?;

    let mut report = CheckReport {
        name: name.to_string(),
        version,
        detail_hash: config.detail_hash.clone(),
        plugins: Vec::new(),
        problems: Vec::new(),
    };
    let sections: [(&str, &[crate::pipeline::PluginEntry], fn(PluginKind) -> bool); 5] = [
        ("extensions", &config.document.extensions, |k| k == PluginKind::Extension),
        ("inputs", &config.document.inputs, PluginKind::is_input),
        ("processors", &config.document.processors, |k| k == PluginKind::Processor),
        ("aggregators", &config.document.aggregators, |k| k == PluginKind::Aggregator),
        ("flushers", &config.document.flushers, |k| k == PluginKind::Flusher),
    ];
    for (section, entries, accepts) in sections {
        for entry in entries {
            let plugin_type = entry.plugin_type();
            report.plugins.push(entry.type_with_id.clone());
            match registry.create(plugin_type, version, entry.detail.as_ref()) {
                Ok(instance) if accepts(instance.kind()) => {}
                Ok(instance) => report.problems.push(format!(
                    "{}: {} is a {}",
                    section,
                    plugin_type,
                    instance.kind()
                )),
                Err(e) => report.problems.push(format!("{}: {}", section, e)),
            }
        }
    }
    Ok(report)
}

pub fn check(
    config_path: Option<PathBuf>,
    document: &Path,
) -> Result<bool, Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => crate::config::load_config(&path)?,
        None => crate::config::AgentConfig::default(),
    };
    let name = document
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("pipeline")
        .to_string();
    let text = fs::read_to_string(document)
        .map_err(|e| format!("failed to read {}: {}", document.display(), e))?;

    let registry = PluginRegistry::with_builtins();
    let report = check_document(&registry, &config.global, &config.runtime, &name, &text)?;

    println!("pipeline:  {}", report.name);
    println!("version:   {}", report.version);
    println!("hash:      {}", report.detail_hash);
    println!("plugins:   {}", report.plugins.join(", "));
    if report.is_ok() {
        println!("OK");
    } else {
        for problem in &report.problems {
            eprintln!("error: {}", problem);
        }
    }
    Ok(report.is_ok())
}
