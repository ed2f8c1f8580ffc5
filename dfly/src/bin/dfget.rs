//! dfget：命令行下载入口，把请求转给本机 daemon。
//! 退出码：0 成功，1 参数错误，2 任务失败，3 IO / 通信错误

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dfly::rpc::message::{Code, DownRequest, DownResult, ErrorReply, Pattern, UrlMeta};
use dfly::rpc::peer;
use dfly::rpc::{codes, decode, read_frame, write_frame};
use dfly_util::default_logger;
use tokio::net::TcpStream;
use tracing::{error, info, Level};

default_logger!(Level::INFO);

/// 探活超时
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "dfget", about = "通过 P2P 网络下载文件")]
struct Args {
    /// 资源地址
    #[arg(long)]
    url: String,

    /// 输出文件路径
    #[arg(long)]
    output: PathBuf,

    /// 附加请求头，形如 "Key: Value"，可多次
    #[arg(long = "header")]
    headers: Vec<String>,

    /// 期望摘要，形如 md5:HEX
    #[arg(long, default_value = "")]
    digest: String,

    /// 字节范围，形如 START-END
    #[arg(long, default_value = "")]
    range: String,

    /// 下载模式
    #[arg(long, default_value = "p2p")]
    pattern: String,

    /// 业务标记
    #[arg(long, default_value = "")]
    callsystem: String,

    /// 限速（字节/秒），0 不限
    #[arg(long, default_value_t = 0)]
    limit: u64,

    /// 禁止回源
    #[arg(long, default_value_t = false)]
    disable_back_source: bool,

    /// 整体超时（秒），0 不限
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// 本机 daemon 地址
    #[arg(long, default_value = "127.0.0.1:65001")]
    daemon: SocketAddr,
}

fn parse_headers(raw: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut headers = BTreeMap::new();
    for item in raw {
        let Some((key, value)) = item.split_once(':') else {
            return Err(format!("请求头格式不对: {}", item));
        };
        headers.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap 的帮助 / 版本输出不算错
            if e.use_stderr() {
                eprintln!("{}", e);
                return ExitCode::from(1);
            }
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    let pattern: Pattern = match args.pattern.parse() {
        Ok(p) => p,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };
    let headers = match parse_headers(&args.headers) {
        Ok(h) => h,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };

    let request = DownRequest {
        url: args.url.clone(),
        output: args.output.to_string_lossy().to_string(),
        url_meta: UrlMeta {
            digest: args.digest.clone(),
            tag: args.callsystem.clone(),
            range: args.range.clone(),
            filter: String::new(),
            header: headers,
        },
        pattern,
        limit: args.limit,
        disable_back_source: args.disable_back_source,
        callsystem: args.callsystem.clone(),
    };
    if let Err(e) = request.validate() {
        error!("{}", e);
        return ExitCode::from(1);
    }

    // 先探活，daemon 不在就别把错误归到下载头上
    if let Err(e) = peer::check_health(args.daemon, HEALTH_CHECK_TIMEOUT).await {
        error!("daemon [{}] 不可用: {}", args.daemon, e);
        return ExitCode::from(3);
    }

    let download = run_download(args.daemon, request);
    let result = if args.timeout > 0 {
        match tokio::time::timeout(Duration::from_secs(args.timeout), download).await {
            Ok(result) => result,
            Err(_) => {
                error!("下载超时");
                return ExitCode::from(2);
            }
        }
    } else {
        download.await
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("与 daemon 通信失败: {}", e);
            ExitCode::from(3)
        }
    }
}

/// 成功返回 Ok(true)，任务失败返回 Ok(false)，通信失败返回 Err
async fn run_download(daemon: SocketAddr, request: DownRequest) -> anyhow::Result<bool> {
    let mut conn = TcpStream::connect(daemon).await?;
    write_frame(&mut conn, codes::DOWNLOAD, &request).await?;

    loop {
        let Some((code, payload)) = read_frame(&mut conn).await? else {
            anyhow::bail!("daemon 提前关闭了连接");
        };
        match code {
            codes::DOWN_RESULT => {
                let result: DownResult = decode(&payload)?;
                if result.done {
                    if result.code.is_success() {
                        info!("下载完成, {} 字节", result.completed_length);
                        return Ok(true);
                    }
                    error!("下载失败 [{:?}]: {}", result.code, result.msg);
                    return Ok(false);
                }
                info!("已下载 {} 字节", result.completed_length);
            }
            codes::ERROR => {
                let reply: ErrorReply = decode(&payload)?;
                if reply.code == Code::ClientError {
                    error!("请求被拒绝: {}", reply.message);
                    return Ok(false);
                }
                error!("daemon 返回错误 [{:?}]: {}", reply.code, reply.message);
                return Ok(false);
            }
            other => anyhow::bail!("意外的响应帧: {}", other),
        }
    }
}
