//! 任务 / peer 标识生成。
//! task_id 必须跨实现字节稳定，所有成分的拼接顺序不能变

use crate::digest::sha256_hex;
use rand::Rng;
use std::collections::BTreeMap;
use url::Url;

/// 生成 peer id。同一任务的多次尝试必须各不相同，
/// 因此带上进程号和随机后缀
pub fn gen_peer_id(ip: &str) -> String {
    let suffix: [u8; 4] = rand::thread_rng().gen();
    format!("{}-{}-{}", ip, std::process::id(), hex::encode(suffix))
}

/// 推导任务 id：
/// sha256("URL|filteredQuery|k1=v1;k2=v2|range|digest|tag") 的 hex 编码。
/// filter 是逗号分隔的查询参数名，命中的参数从 query 中剔除；
/// header 按键名排序后拼接，保证不受入参顺序影响
pub fn task_id(
    url: &str,
    filter: &str,
    headers: &BTreeMap<String, String>,
    range: &str,
    digest: &str,
    tag: &str,
) -> String {
    let filtered_query = filtered_query(url, filter);
    let canonical_header = headers
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(";");

    let content = format!(
        "{}|{}|{}|{}|{}|{}",
        url, filtered_query, canonical_header, range, digest, tag
    );
    sha256_hex(content.as_bytes())
}

/// 剔除 filter 命中的查询参数，保留其余参数的原始顺序
fn filtered_query(url: &str, filter: &str) -> String {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return String::new(),
    };
    if parsed.query().is_none() {
        return String::new();
    }

    let drops: Vec<&str> = filter
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    parsed
        .query_pairs()
        .filter(|(k, _)| !drops.contains(&k.as_ref()))
        .map(|(k, v)| {
            if v.is_empty() {
                k.to_string()
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}
