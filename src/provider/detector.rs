//! 默认探测脚本
//!
//! 页面侧逻辑：先扫描一次，再用 MutationObserver 监听 DOM 变化；
//! 第一个 href 或文本包含标识串的 `<a>` 通过绑定函数回报（JSON 编码的字符串）。
//! 同一文档内只回报一次，刷新后重新注入会再次扫描，重复回报由调用方丢弃。

use serde_json::Value;

/// 绑定函数名前缀；完整名称带会话实例号，避免并发会话之间冲突
pub const BINDING_PREFIX: &str = "__linkwatch_found_";

/// 探测参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorParams {
    /// 页面侧回调的绑定名（每个会话实例唯一）
    pub binding: String,
    pub identifier: String,
    /// 作用范围选择器，None 表示整个文档
    pub container: Option<String>,
}

impl DetectorParams {
    pub fn for_instance(instance: u64, identifier: &str, container: Option<&str>) -> Self {
        Self {
            binding: format!("{}{}", BINDING_PREFIX, instance),
            identifier: identifier.to_string(),
            container: container
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        }
    }
}

fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

fn js_container(container: &Option<String>) -> String {
    container
        .as_deref()
        .map(js_string)
        .unwrap_or_else(|| "null".to_string())
}

/// 生成注入用的探测脚本（返回 "found" / "watching" / "already-reported"）
pub fn detector_script(params: &DetectorParams) -> String {
    format!(
        r#"
(function () {{
    const binding = {binding};
    const identifier = {identifier};
    const containerSelector = {container};
    const flag = "__reported_" + binding;
    let observer = null;
    if (window[flag]) {{
        return "already-reported";
    }}
    const report = (href) => {{
        if (window[flag]) return;
        window[flag] = true;
        if (observer) observer.disconnect();
        try {{
            window[binding](JSON.stringify(href));
        }} catch (e) {{
            window[flag] = false;
        }}
    }};
    const scan = () => {{
        const root = containerSelector ? document.querySelector(containerSelector) : document;
        if (!root) return false;
        for (const a of root.querySelectorAll("a[href]")) {{
            const href = a.href || a.getAttribute("href") || "";
            const text = a.textContent || "";
            if (href.includes(identifier) || text.includes(identifier)) {{
                report(href);
                return true;
            }}
        }}
        return false;
    }};
    if (scan()) {{
        return "found";
    }}
    observer = new MutationObserver(() => {{ scan(); }});
    observer.observe(document.documentElement || document, {{
        childList: true,
        subtree: true,
        attributes: true,
        attributeFilter: ["href"],
    }});
    return "watching";
}})()
"#,
        binding = js_string(&params.binding),
        identifier = js_string(&params.identifier),
        container = js_container(&params.container),
    )
}

/// 生成一次性探查脚本：返回第一个匹配链接的 href，没有则返回 null
pub fn probe_script(params: &DetectorParams) -> String {
    format!(
        r#"
(function () {{
    const identifier = {identifier};
    const containerSelector = {container};
    const root = containerSelector ? document.querySelector(containerSelector) : document;
    if (!root) return null;
    for (const a of root.querySelectorAll("a[href]")) {{
        const href = a.href || a.getAttribute("href") || "";
        if (href.includes(identifier) || (a.textContent || "").includes(identifier)) {{
            return href;
        }}
    }}
    return null;
}})()
"#,
        identifier = js_string(&params.identifier),
        container = js_container(&params.container),
    )
}
