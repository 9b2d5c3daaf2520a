//! 路径工具
//!
//! 配置文件路径的 tilde (~) 展开与收缩

use std::path::{Path, PathBuf};

/// 展开路径开头的 `~` 为用户主目录
///
/// 只支持 `~` 和 `~/path`；`~user/path` 以及无法获取主目录时返回原路径
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    let path_str = path.to_string_lossy();

    let Some(home_dir) = dirs::home_dir() else {
        return path.to_path_buf();
    };

    if path_str == "~" {
        home_dir
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        home_dir.join(rest)
    } else {
        path.to_path_buf()
    }
}

/// 将主目录下的路径收缩为 `~/...`，用于日志输出
pub fn collapse_tilde<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();
    let Some(home_dir) = dirs::home_dir() else {
        return path.to_string_lossy().to_string();
    };

    match path.strip_prefix(&home_dir) {
        Ok(stripped) if stripped.as_os_str().is_empty() => "~".to_string(),
        Ok(stripped) => format!("~/{}", stripped.to_string_lossy()),
        Err(_) => path.to_string_lossy().to_string(),
    }
}
