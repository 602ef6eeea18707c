use clap::{crate_authors, crate_description, crate_name, crate_version, App, AppSettings, Arg};

fn config_arg() -> Arg<'static> {
    Arg::new("config")
        .long("config")
        .value_name("FILE")
        .help("Campaign configuration file")
        .takes_value(true)
        .required(true)
}

fn seed_arg() -> Arg<'static> {
    Arg::new("seed")
        .long("seed")
        .value_name("N")
        .help("Seed for all random decisions")
        .takes_value(true)
        .default_value("424242")
}

pub fn args() -> App<'static> {
    App::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!(", "))
        .about(crate_description!())
        .subcommand(
            App::new("discover")
                .about("Run discovery campaigns against the configured predictors")
                .arg(config_arg())
                .arg(
                    Arg::new("check-config")
                        .long("check-config")
                        .help("Validate the configuration and exit"),
                )
                .arg(
                    Arg::new("loop")
                        .long("loop")
                        .help("Keep starting new campaigns until interrupted"),
                )
                .arg(
                    Arg::new("split-configs")
                        .long("split-configs")
                        .help("Run one campaign per predictor pair"),
                )
                .arg(seed_arg())
                .arg(
                    Arg::new("outdir")
                        .value_name("OUTDIR")
                        .help("Directory for campaign results")
                        .required(true),
                ),
        )
        .subcommand(
            App::new("generalize")
                .about("Generalize a basic block into an abstract block")
                .arg(config_arg())
                .arg(seed_arg())
                .arg(
                    Arg::new("no-minimize")
                        .long("no-minimize")
                        .help("Skip minimization of the seed block"),
                )
                .arg(
                    Arg::new("no-restrict-to-supported")
                        .long("no-restrict-to-supported")
                        .help("Keep schemes that some predictor does not support"),
                )
                .arg(
                    Arg::new("interactive")
                        .long("interactive")
                        .help("Choose expansions interactively"),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("DIR")
                        .help("Directory for generalization results")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("asm-file")
                        .value_name("ASM_FILE")
                        .help("Assembly file with the seed basic block")
                        .required(true),
                )
                .arg(
                    Arg::new("predictors")
                        .value_name("PREDICTOR")
                        .help("Keys of the predictors under test")
                        .multiple(true)
                        .required(true),
                ),
        )
        .subcommand(
            App::new("check-predictors")
                .about("Probe each predictor with every instruction scheme")
                .arg(config_arg())
                .arg(
                    Arg::new("write-filter")
                        .long("write-filter")
                        .help("Write a filter list of failing schemes per predictor"),
                )
                .arg(
                    Arg::new("batch-size")
                        .long("batch-size")
                        .value_name("N")
                        .help("Schemes per evaluation batch")
                        .takes_value(true)
                        .default_value("100"),
                )
                .arg(
                    Arg::new("predictors")
                        .value_name("PREDICTOR")
                        .help("Predictor keys to check (default: all registered)")
                        .multiple(true),
                ),
        )
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .global_setting(AppSettings::GlobalVersion)
}
