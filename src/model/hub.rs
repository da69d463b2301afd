// 该文件是 Grounded-SAM 项目的一部分。
// src/model/hub.rs - 模型仓库下载
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

use std::path::PathBuf;

use hf_hub::{
  Repo, RepoType,
  api::sync::{Api, ApiBuilder, ApiError, ApiRepo},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum HubError {
  #[error("无法初始化模型仓库客户端: {0}")]
  Init(#[source] ApiError),
  #[error("无法从仓库 {repo} 获取文件 {file}: {source}")]
  Download {
    repo: String,
    file: String,
    #[source]
    source: ApiError,
  },
}

/// 远程模型仓库，下载的文件缓存在本地，重复运行不会再次下载
pub struct HubRepo {
  repo_id: String,
  repo: ApiRepo,
}

impl HubRepo {
  pub fn open(
    repo_id: &str,
    revision: Option<&str>,
    cache_dir: Option<PathBuf>,
  ) -> Result<Self, HubError> {
    let api = match cache_dir {
      Some(dir) => {
        debug!("模型缓存目录: {}", dir.display());
        ApiBuilder::new()
          .with_cache_dir(dir)
          .with_progress(true)
          .build()
      }
      None => Api::new(),
    }
    .map_err(HubError::Init)?;

    let repo = match revision {
      Some(rev) => api.repo(Repo::with_revision(
        repo_id.to_string(),
        RepoType::Model,
        rev.to_string(),
      )),
      None => api.model(repo_id.to_string()),
    };

    Ok(Self {
      repo_id: repo_id.to_string(),
      repo,
    })
  }

  /// 获取文件的本地路径，首次使用时从网络下载
  pub fn fetch(&self, file: &str) -> Result<PathBuf, HubError> {
    info!("获取 {}/{}", self.repo_id, file);
    let path = self.repo.get(file).map_err(|source| HubError::Download {
      repo: self.repo_id.clone(),
      file: file.to_string(),
      source,
    })?;
    debug!("{} -> {}", file, path.display());
    Ok(path)
  }
}
