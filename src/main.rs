use anyhow::{anyhow, bail, Context, Result};
use pivot_builder::codec::{from_query_string, to_query_string, QueryParams};
use pivot_builder::config::{BuilderConfig, DEFAULT_CONFIG_FILE};
use pivot_builder::field::{Aggregator, FilterValue, Operator, Role};
use pivot_builder::gateway::{FileGateway, LegacyRequest, Resolution, StructuredRequest};
use pivot_builder::reorder::{MoveOutcome, MoveRequest};
use pivot_builder::saved::SavedQuery;
use pivot_builder::session::{BuilderState, EditAggregatorsCommand, EditFilterCommand};
use pivot_builder::sql_compiler::SqlCompiler;
use pivot_builder::{PivotSnapshot, RelativeFlags};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

const HELP: &str = r#"可用命令:
  show                                   显示当前字段
  add <role> <field> [before]            从字段列表拖入新字段
  move <index> <role> [before]           移动字段 (role: row/col/value/filter)
  filter <op> <value...>                 完成待定的过滤字段
  abandon                                放弃待定的过滤字段
  rm <index>                             删除字段
  aggs <index> <agg...>                  修改值字段的聚合函数
  where <index> <op> <value...>          修改过滤条件
  relative on|off [column baseline metric]
  params                                 显示当前 URL 参数
  load <query-string>                    从 URL 参数恢复
  save <name> [file]                     保存查询
  open <file>                            打开保存的查询
  request                                显示结构化和旧版请求
  sql                                    SQL 预览
  exec <file> [legacy]                   用文件中的结果执行查询
  help | quit"#;

/// 一行 shell 输入
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Show,
    Add { role: Role, field: String, before: Option<isize> },
    Move(MoveTarget),
    Filter { operator: Operator, value: FilterValue },
    Abandon,
    Remove(usize),
    Aggregators(EditAggregatorsCommand),
    Where(EditFilterCommand),
    Relative { enabled: bool, settings: Option<(String, String, String)> },
    Params,
    Load(String),
    Save { name: String, file: Option<String> },
    Open(String),
    Request,
    Sql,
    Exec { file: String, legacy: bool },
    Help,
    Quit,
}

/// `move` 只给出目标, 源角色从注册表中读取
#[derive(Debug, Clone, PartialEq, Eq)]
struct MoveTarget {
    index: usize,
    role: Role,
    before: Option<isize>,
}

fn parse_index(word: &str) -> Result<usize> {
    word.parse().with_context(|| format!("无效的位置: {}", word))
}

fn parse_before(word: Option<&String>) -> Result<Option<isize>> {
    word.map(|w| w.parse().with_context(|| format!("无效的插入位置: {}", w)))
        .transpose()
}

/// `in`/`not in` 取多个值, 其余运算符把剩余单词合并成一个值
fn parse_filter(words: &[String]) -> Result<(Operator, FilterValue)> {
    let (op, values) = words.split_first().ok_or_else(|| anyhow!("缺少运算符"))?;
    let operator: Operator = op.parse()?;
    if values.is_empty() {
        bail!("缺少过滤值");
    }
    let value = if operator.takes_list() {
        FilterValue::List(values.to_vec())
    } else {
        FilterValue::Single(values.join(" "))
    };
    Ok((operator, value))
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let words = shell_words::split(line).context("无法解析输入")?;
    let Some((name, args)) = words.split_first() else {
        return Ok(None);
    };
    let arg = |i: usize| {
        args.get(i).ok_or_else(|| anyhow!("`{}` 缺少参数, 输入 help 查看用法", name))
    };

    let command = match name.as_str() {
        "show" => Command::Show,
        "add" => Command::Add {
            role: arg(0)?.parse()?,
            field: arg(1)?.clone(),
            before: parse_before(args.get(2))?,
        },
        "move" | "mv" => Command::Move(MoveTarget {
            index: parse_index(arg(0)?)?,
            role: arg(1)?.parse()?,
            before: parse_before(args.get(2))?,
        }),
        "filter" => {
            let (operator, value) = parse_filter(args)?;
            Command::Filter { operator, value }
        }
        "abandon" => Command::Abandon,
        "rm" => Command::Remove(parse_index(arg(0)?)?),
        "aggs" => {
            let index = parse_index(arg(0)?)?;
            let aggregators = args[1..]
                .iter()
                .map(|a| a.parse::<Aggregator>())
                .collect::<Result<Vec<_>, _>>()?;
            Command::Aggregators(EditAggregatorsCommand { index, aggregators })
        }
        "where" => {
            let index = parse_index(arg(0)?)?;
            let (operator, value) = parse_filter(&args[1..])?;
            Command::Where(EditFilterCommand { index, operator, value })
        }
        "relative" => {
            let enabled = match arg(0)?.as_str() {
                "on" => true,
                "off" => false,
                other => bail!("relative 只接受 on/off: {}", other),
            };
            let settings = match &args[1..] {
                [] => None,
                [column, baseline, metric] => {
                    Some((column.clone(), baseline.clone(), metric.clone()))
                }
                _ => bail!("relative 需要 column baseline metric 三个参数"),
            };
            Command::Relative { enabled, settings }
        }
        "params" => Command::Params,
        "load" => Command::Load(arg(0)?.clone()),
        "save" => Command::Save { name: arg(0)?.clone(), file: args.get(1).cloned() },
        "open" => Command::Open(arg(0)?.clone()),
        "request" => Command::Request,
        "sql" => Command::Sql,
        "exec" => Command::Exec {
            file: arg(0)?.clone(),
            legacy: matches!(args.get(1).map(String::as_str), Some("legacy")),
        },
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("未知命令: {}", other),
    };
    Ok(Some(command))
}

fn print_state(state: &BuilderState) {
    println!("[字段]:");
    for (i, field) in state.registry().iter().enumerate() {
        println!("  {:>2}  {}", i, field);
    }
    if let Some(pending) = state.pending_filter() {
        println!("  待定过滤: {} (filter <op> <value> 完成, abandon 放弃)", pending.field);
    }
    let relative = state.relative();
    if relative.enabled {
        println!(
            "[相对值]: {} = {} / {}",
            relative.column.as_deref().unwrap_or("-"),
            relative.baseline.as_deref().unwrap_or("-"),
            relative.metric.as_deref().unwrap_or("-")
        );
    }
}

fn print_params(params: &QueryParams) {
    println!("?{}", to_query_string(params));
}

/// 返回 false 时退出 shell
fn run_command(
    state: &mut BuilderState,
    config: &BuilderConfig,
    compiler: &SqlCompiler,
    command: Command,
) -> Result<bool> {
    match command {
        Command::Show => print_state(state),
        Command::Add { role, field, before } => {
            if let MoveOutcome::PendingFilter(pending) = state.place(field, role, before)? {
                println!("{} 等待运算符和值", pending.field);
            }
            print_state(state);
        }
        Command::Move(target) => {
            let source = state
                .registry()
                .get(target.index)
                .map(|f| f.role)
                .ok_or_else(|| anyhow!("没有位置 {} 的字段", target.index))?;
            let mut request = MoveRequest::new(target.index, source, target.role);
            request.before_index = target.before;
            if let MoveOutcome::PendingFilter(pending) = state.apply_move(request)? {
                println!("{} 等待运算符和值", pending.field);
            }
            print_state(state);
        }
        Command::Filter { operator, value } => {
            state.complete_filter(operator, value)?;
            print_state(state);
        }
        Command::Abandon => match state.abandon_filter() {
            Some(pending) => println!("已放弃 {}", pending.field),
            None => println!("没有待定的过滤字段"),
        },
        Command::Remove(index) => {
            state.remove(index)?;
            print_state(state);
        }
        Command::Aggregators(edit) => {
            state.edit_aggregators(edit)?;
            print_state(state);
        }
        Command::Where(edit) => {
            state.edit_filter(edit)?;
            print_state(state);
        }
        Command::Relative { enabled, settings } => {
            let mut flags = state.relative().clone();
            flags.enabled = enabled;
            if let Some((column, baseline, metric)) = settings {
                flags = RelativeFlags {
                    enabled,
                    column: Some(column),
                    baseline: Some(baseline),
                    metric: Some(metric),
                };
            }
            state.set_relative(flags)?;
        }
        Command::Params => print_params(&state.params()),
        Command::Load(query) => {
            state.replace(PivotSnapshot::from_params(&from_query_string(&query)));
            print_state(state);
        }
        Command::Save { name, file } => {
            let saved = state.save(&name, &config.target)?;
            match file {
                Some(path) => {
                    saved.write_file(&path)?;
                    println!("已保存到 {}", path);
                }
                None => println!("{}", saved.to_json()?),
            }
        }
        Command::Open(path) => {
            let saved = SavedQuery::read_file(&path)?;
            println!("打开 {} ({})", saved.name, saved.created_at.to_rfc3339());
            state.replace(saved.snapshot());
            print_state(state);
        }
        Command::Request => {
            let structured = StructuredRequest::from_registry(state.registry());
            println!("[结构化请求]:\n{}", serde_json::to_string_pretty(&structured)?);
            let legacy = LegacyRequest::from_registry(state.registry());
            println!("[旧版请求]:");
            print_params(&legacy.params);
        }
        Command::Sql => {
            let result = compiler.compile(&StructuredRequest::from_registry(state.registry()))?;
            println!("[SQL]:\n{}", result.sql);
        }
        Command::Exec { file, legacy } => {
            let gateway = FileGateway::new(&file);
            if legacy {
                match state.render(&gateway) {
                    Resolution::Applied(fragment) => println!("{}", fragment.0),
                    Resolution::Failed(e) => println!("❌ 执行失败: {}", e),
                    Resolution::Stale => println!("⚠️ 结果已过期"),
                }
                return Ok(true);
            }
            match state.execute(&gateway) {
                Resolution::Applied(rows) => {
                    println!("[结果]: {} 行", rows.len());
                    for row in rows {
                        println!("  {}", serde_json::Value::Object(row));
                    }
                }
                Resolution::Failed(e) => println!("❌ 执行失败: {}", e),
                Resolution::Stale => println!("⚠️ 结果已过期"),
            }
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = BuilderConfig::load_or_default(&config_path);
    let compiler = SqlCompiler::with_table_mapping(config.table_mapping.clone());

    // URL 镜像: 每次变更后打印新的查询串
    let sink = |params: &QueryParams| println!("→ ?{}", to_query_string(params));
    let mut state = BuilderState::seeded(&config, Box::new(sink))?;

    println!("--- Pivot Builder ---");
    print_state(&state);
    println!("输入 help 查看命令");

    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline("pivot> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                editor.add_history_entry(line.as_str())?;
                let command = match parse_command(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("❌ {:#}", e);
                        continue;
                    }
                };
                match run_command(&mut state, &config, &compiler, command) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("❌ {:#}", e),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
