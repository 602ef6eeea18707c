mod cli;

use anyhow::{Context, Result};
use clap::ArgMatches;
use log::{info, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anica::abstraction::AbstractBlock;
use anica::config::{prepare_campaign_dir, CampaignConfig, ConfigError};
use anica::discovery::{
    self, discover, minimize, new_stop_token, CampaignEnd, Discovery, InteractiveChoice, Strategy,
};
use anica::iwho::parse::parse_block;

fn main() {
    env_logger::init();

    let matches = cli::args().get_matches();
    let result = match matches.subcommand() {
        Some(("discover", m)) => cmd_discover(m),
        Some(("generalize", m)) => cmd_generalize(m),
        Some(("check-predictors", m)) => cmd_check_predictors(m),
        _ => unreachable!("a subcommand is required"),
    };

    match result {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {:#}", err);
            let code = if err.downcast_ref::<ConfigError>().is_some() { 1 } else { 2 };
            std::process::exit(code);
        }
    }
}

fn parse_seed(matches: &ArgMatches) -> Result<u64> {
    matches
        .value_of("seed")
        .unwrap()
        .parse()
        .context("the seed must be a non-negative integer")
}

fn append_log(dir: &Path, line: &str) {
    let path = dir.join("log.txt");
    let entry = fs::OpenOptions::new().create(true).append(true).open(&path);
    match entry {
        Ok(mut file) => {
            let _ = writeln!(file, "{}", line);
        }
        Err(e) => warn!("cannot write {}: {}", path.display(), e),
    }
}

fn cmd_discover(matches: &ArgMatches) -> Result<()> {
    let config_path = Path::new(matches.value_of("config").unwrap());
    let seed = parse_seed(matches)?;

    let config = CampaignConfig::load(config_path)?;
    config.validate()?;
    let configs = config.expand(matches.is_present("split-configs"))?;

    if matches.is_present("check-config") {
        for config in &configs {
            config.build_context(true)?;
        }
        println!("configuration OK ({} campaign(s))", configs.len());
        return Ok(());
    }

    let outdir = PathBuf::from(matches.value_of("outdir").unwrap());
    fs::create_dir_all(&outdir)
        .with_context(|| format!("cannot create output directory {}", outdir.display()))?;

    let stop = new_stop_token();
    let mut campaign_idx = 0usize;
    loop {
        for config in &configs {
            let (campaign_dir, runtime_config) =
                prepare_campaign_dir(config, &outdir, campaign_idx)?;
            campaign_idx += 1;

            append_log(&campaign_dir, &format!("campaign started (seed {})", seed));
            info!("starting campaign in {}", campaign_dir.display());

            let mut actx = runtime_config.build_context(true)?;
            match discover(&mut actx, &runtime_config.termination, seed, Some(&campaign_dir), &stop)
            {
                Ok((discoveries, end)) => {
                    let line = format!(
                        "campaign finished ({:?}): {} discoveries",
                        end,
                        discoveries.len()
                    );
                    append_log(&campaign_dir, &line);
                    println!("{}: {}", campaign_dir.display(), line);
                    if end == CampaignEnd::Stopped {
                        return Ok(());
                    }
                }
                Err(e) => {
                    // the next campaign still gets its chance
                    append_log(&campaign_dir, &format!("campaign ended prematurely: {}", e));
                    warn!("campaign ended prematurely: {}", e);
                }
            }
        }
        if !matches.is_present("loop") {
            break;
        }
    }
    Ok(())
}

fn cmd_generalize(matches: &ArgMatches) -> Result<()> {
    let config_path = Path::new(matches.value_of("config").unwrap());
    let seed = parse_seed(matches)?;

    let mut config = CampaignConfig::load(config_path)?;
    config.predictors = matches
        .values_of("predictors")
        .unwrap()
        .map(str::to_string)
        .collect();
    config.validate()?;

    let restrict = !matches.is_present("no-restrict-to-supported");
    let mut actx = config.build_context(restrict)?;

    let asm_path = Path::new(matches.value_of("asm-file").unwrap());
    let asm_text = fs::read_to_string(asm_path)
        .with_context(|| format!("cannot read {}", asm_path.display()))?;
    let bb = parse_block(&actx.iwho, &asm_text)?;
    if bb.is_empty() {
        anyhow::bail!("the input block is empty");
    }

    let out_dir = match matches.value_of("output") {
        Some(dir) => PathBuf::from(dir),
        None => {
            let timestamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            PathBuf::from(format!("generalization_{}", timestamp))
        }
    };
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("cannot create output directory {}", out_dir.display()))?;

    fs::write(out_dir.join("start_bb.s"), format!("{}\n", bb.asm(&actx.iwho)))?;

    let mut rng: rand::rngs::StdRng = rand::SeedableRng::seed_from_u64(seed);
    let min_bb = if matches.is_present("no-minimize") {
        bb
    } else {
        minimize(&mut actx, &bb, &mut rng)?
    };
    fs::write(out_dir.join("minimized_bb.s"), format!("{}\n", min_bb.asm(&actx.iwho)))?;

    let seed_ab = AbstractBlock::from_concrete(&actx.fm, &min_bb);
    let strategy = if matches.is_present("interactive") {
        Strategy::Interactive
    } else {
        actx.discovery_cfg
            .strategies()
            .into_iter()
            .next()
            .unwrap_or(Strategy::MaxBenefit)
    };

    let mut callback = stdin_expansion_picker();
    let interact = if matches.is_present("interactive") {
        Some(&mut *callback)
    } else {
        None
    };
    let (block, trace, result_ref) =
        discovery::generalize::generalize(&mut actx, &seed_ab, &strategy, seed, interact)?;

    println!("generalized abstract block:\n{}", block.display(&actx.fm));

    let result = Discovery {
        id: "g000".to_string(),
        block,
        trace,
        result_ref,
        remarks: vec!["generalized from user-provided seed block".to_string()],
    };
    fs::write(
        out_dir.join("discovery.json"),
        serde_json::to_string_pretty(&discovery::discovery_to_json(&actx, &result)).unwrap(),
    )?;
    result.trace.dump_json(&actx.fm, &out_dir.join("witness.json"))?;

    let infos = serde_json::json!({
        "seed": seed,
        "predictors": actx.predictor_keys,
        "minimized": !matches.is_present("no-minimize"),
        "witness_len": result.trace.len(),
        "result_ref": result.result_ref,
    });
    fs::write(out_dir.join("infos.json"), serde_json::to_string_pretty(&infos).unwrap())?;

    println!("results written to {}", out_dir.display());
    Ok(())
}

/// Reads expansion choices from stdin, presenting the current abstract
/// block and the available expansions with their benefit estimates.
fn stdin_expansion_picker() -> Box<discovery::InteractiveCallback<'static>> {
    Box::new(|actx, block, expansions| {
        println!("current abstract block:\n{}", block.display(&actx.fm));
        println!("possible expansions:");
        for (idx, (expansion, benefit)) in expansions.iter().enumerate() {
            println!("  [{:3}] {} (benefit {})", idx, expansion, benefit);
        }
        loop {
            print!("expansion index (or 'q' to finish): ");
            let _ = std::io::Write::flush(&mut std::io::stdout());
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return InteractiveChoice::TerminateEarly;
            }
            let line = line.trim();
            if line == "q" {
                return InteractiveChoice::TerminateEarly;
            }
            match line.parse::<usize>() {
                Ok(idx) if idx < expansions.len() => return InteractiveChoice::Expand(idx),
                _ => println!("not a valid expansion index: {}", line),
            }
        }
    })
}

fn cmd_check_predictors(matches: &ArgMatches) -> Result<()> {
    let config_path = Path::new(matches.value_of("config").unwrap());
    let batch_size: usize = matches
        .value_of("batch-size")
        .unwrap()
        .parse()
        .context("the batch size must be a positive integer")?;
    if batch_size == 0 {
        anyhow::bail!("the batch size must be a positive integer");
    }

    let mut config = CampaignConfig::load(config_path)?;
    if let Some(keys) = matches.values_of("predictors") {
        config.predictors = keys.map(str::to_string).collect();
    } else if config.predictors.is_empty() {
        config.predictors = vec![".*".to_string()];
    }
    config.validate()?;

    let mut actx = config.build_context(false)?;
    let scheme_ids: Vec<_> = actx.iwho.filtered_schemes().to_vec();
    let asms: Vec<String> = scheme_ids
        .iter()
        .map(|&id| {
            let insn = actx.iwho.default_instance(id);
            actx.iwho.render_insn(&insn)
        })
        .collect();

    let keys = actx.predictor_keys.clone();
    for key in &keys {
        let mut failing: Vec<String> = Vec::new();
        for (chunk_ids, chunk_asms) in scheme_ids
            .chunks(batch_size)
            .zip(asms.chunks(batch_size))
        {
            let batch = actx.predman.evaluate(std::slice::from_ref(key), chunk_asms)?;
            for (id, results) in chunk_ids.iter().zip(batch.results.iter()) {
                if results[key].is_failure() {
                    failing.push(actx.iwho.scheme(*id).name.clone());
                }
            }
        }
        println!(
            "{}: {}/{} schemes failed",
            key,
            failing.len(),
            scheme_ids.len()
        );
        if matches.is_present("write-filter") && !failing.is_empty() {
            let sanitized: String = key
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            let path = PathBuf::from(format!("filter_{}.csv", sanitized));
            let mut content = String::new();
            for name in &failing {
                content.push_str(name);
                content.push('\n');
            }
            fs::write(&path, content)?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}
