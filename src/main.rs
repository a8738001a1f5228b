use std::collections::BTreeMap;
use std::time::Duration;

use clap::{Arg, Command};
use speedsim::logging::{self, LogConfig, LogOutput};
use speedsim::scenario::ScenarioConfig;
use speedsim::simulation::SimulationEngine;
use speedsim::telemetry::{LoopbackBroker, TelemetryPublisher};
use tracing::warn;

fn main() {
    // コマンドライン引数の解析
    let matches = Command::new("speedsim")
        .version("0.1.0")
        .about("スマート速度制御シミュレーター (Smart Speed Control Simulator)")
        .long_about("速度制限ゾーンを走行する車両の速度を監視し、制限超過時に加速を規制します。\n\
                     位置・速度・制御状態はテレメトリとしてブローカーへ送信されます。")
        .arg(
            Arg::new("scenario")
                .short('s')
                .long("scenario")
                .value_name("FILE")
                .help("シナリオファイル(.yaml)のパスを指定")
                .conflicts_with("demo")
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(clap::ArgAction::SetTrue)
                .help("シナリオの情報のみ表示して終了")
        )
        .arg(
            Arg::new("demo")
                .short('d')
                .long("demo")
                .action(clap::ArgAction::SetTrue)
                .help("組み込みの標準シナリオで実行")
        )
        .arg(
            Arg::new("no-telemetry")
                .long("no-telemetry")
                .action(clap::ArgAction::SetTrue)
                .help("テレメトリ送信を無効にする")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("ログレベル (trace, debug, info, warn, error)")
        )
        .arg(
            Arg::new("log-output")
                .long("log-output")
                .value_name("TARGET")
                .default_value("console")
                .value_parser(|s: &str| s.parse::<LogOutput>())
                .help("ログ出力先 (console, file, both)")
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("詳細出力レベル (-v: 基本, -vv: 詳細, -vvv: デバッグ)")
        )
        .get_matches();

    let verbose_level = matches.get_count("verbose");
    let log_config = LogConfig {
        level: match matches.get_one::<String>("log-level") {
            Some(level) => logging::parse_log_level(level),
            None => logging::level_for_verbosity(verbose_level),
        },
        output: matches.get_one::<LogOutput>("log-output").copied().unwrap_or(LogOutput::Console),
        ..LogConfig::default()
    };
    // ファイル出力の非同期ガードは終了まで保持する
    let _log_guard = match logging::init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ログの初期化に失敗: {}", e);
            None
        }
    };

    println!("スマート速度制御シミュレーター - speedsim v0.1.0");
    println!();

    let scenario = if matches.get_flag("demo") {
        Ok(ScenarioConfig::default())
    } else if let Some(path) = matches.get_one::<String>("scenario") {
        ScenarioConfig::from_file(path)
    } else {
        show_default_help();
        return;
    };

    let result = scenario
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
        .and_then(|mut scenario| {
            if matches.get_flag("no-telemetry") {
                scenario.telemetry.enabled = false;
            }
            if matches.get_flag("info") {
                scenario.print_summary();
                return Ok(());
            }
            execute_scenario(scenario, verbose_level)
        });

    if let Err(e) = result {
        eprintln!("エラー: {}", e);
        std::process::exit(1);
    }
}

/// シナリオの実行
fn execute_scenario(scenario: ScenarioConfig, verbose_level: u8) -> Result<(), Box<dyn std::error::Error>> {
    scenario.print_summary();
    println!();

    // 外部ブローカーの代わりにプロセス内ブローカーへ送信し、受信側で件数を数える
    let broker = LoopbackBroker::new();
    let monitor = broker.subscribe("#");

    let telemetry_enabled = scenario.telemetry.enabled;
    let telemetry_config = scenario.telemetry.clone();
    let mut simulation = SimulationEngine::new(scenario, verbose_level);

    if telemetry_enabled {
        let mut publisher = TelemetryPublisher::new(&telemetry_config);
        publisher.connect(broker.transport())?;
        if !publisher.wait_until_connected(Duration::from_secs(2)) {
            warn!("ブローカーに接続できていません。接続までテレメトリ送信はスキップされます");
        }
        simulation.attach_publisher(publisher);
    }

    simulation.initialize()?;
    let summary = simulation.run()?;

    if let Some(mut publisher) = simulation.publisher.take() {
        publisher.disconnect();
    }

    println!();
    summary.print();

    if telemetry_enabled {
        let mut received: BTreeMap<String, usize> = BTreeMap::new();
        for delivery in monitor.try_iter() {
            *received.entry(delivery.topic).or_insert(0) += 1;
        }
        println!("受信メッセージ:");
        for (topic, count) in &received {
            println!("  {}: {} 件", topic, count);
        }
    }

    Ok(())
}

/// デフォルトヘルプとシナリオ一覧を表示
fn show_default_help() {
    println!("使用方法:");
    println!("  speedsim [オプション]");
    println!();
    println!("オプション:");
    println!("  -s, --scenario <FILE>   シナリオファイルを指定して実行");
    println!("  -i, --info              シナリオ情報のみ表示");
    println!("  -d, --demo              組み込みの標準シナリオで実行");
    println!("      --no-telemetry      テレメトリ送信を無効にする");
    println!("      --log-level <LEVEL> ログレベル");
    println!("      --log-output <TARGET> ログ出力先 (console, file, both)");
    println!("  -v, --verbose           詳細出力 (複数指定で詳細レベル上昇)");
    println!("  -h, --help              このヘルプを表示");
    println!();
    println!("利用可能なシナリオファイル:");
    println!("  scenarios/city_drive.yaml          - 標準の3ゾーン走行");
    println!("  scenarios/highway_regulation.yaml  - 高速道路での規制継続");
    println!("  scenarios/zone_edges.yaml          - ゾーン外走行とリセット");
    println!();
    println!("例:");
    println!("  speedsim --demo");
    println!("  speedsim -s scenarios/city_drive.yaml -vv");
    println!("  speedsim -s scenarios/highway_regulation.yaml -i");
}
