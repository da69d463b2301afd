// 该文件是 Grounded-SAM 项目的一部分。
// src/utils.rs - 通用工具函数
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::{Path, PathBuf};

use url::Url;

/// 解析 URL；若字符串不含方案（裸路径），则补上 `default_scheme`
///
/// 相对路径会基于当前工作目录转为绝对路径。
pub fn parse_url_or_path(s: &str, default_scheme: &str) -> Result<Url, url::ParseError> {
  match Url::parse(s) {
    Ok(url) if url.scheme().len() > 1 => Ok(url),
    // 单字符方案多半是 Windows 盘符，或根本不是 URL
    Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => {
      let path = Path::new(s);
      let absolute = if path.is_absolute() {
        path.to_path_buf()
      } else {
        std::env::current_dir()
          .map(|cwd| cwd.join(path))
          .unwrap_or_else(|_| path.to_path_buf())
      };
      let encoded = absolute
        .to_string_lossy()
        .split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/");
      Url::parse(&format!("{}://{}", default_scheme, encoded))
    }
    Err(e) => Err(e),
  }
}

/// 取 URL 中的文件路径并做百分号解码
pub fn url_file_path(url: &Url) -> PathBuf {
  let path = url.path();
  match urlencoding::decode(path) {
    Ok(decoded) => PathBuf::from(decoded.into_owned()),
    Err(_) => PathBuf::from(path),
  }
}

/// 在文件名（扩展名前）追加后缀：`out/a.png` + `_0_1` -> `out/a_0_1.png`
pub fn with_file_suffix(path: &Path, suffix: &str) -> PathBuf {
  let stem = path
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_default();
  let name = match path.extension() {
    Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
    None => format!("{}{}", stem, suffix),
  };
  path.with_file_name(name)
}
