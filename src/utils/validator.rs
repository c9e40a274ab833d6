use anyhow::Result;

pub fn is_valid_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

pub fn validate_chunk_count(chunk_count: usize) -> Result<()> {
    if chunk_count == 0 {
        anyhow::bail!("分块数必须大于0");
    }
    if chunk_count > 64 {
        anyhow::bail!("分块数不能超过64");
    }
    Ok(())
}

pub fn validate_storage_dir(dir: &str) -> Result<()> {
    if dir.is_empty() {
        anyhow::bail!("下载目录不能为空");
    }
    Ok(())
}

pub fn validate_urls(urls: &[String]) -> Result<()> {
    if urls.is_empty() {
        anyhow::bail!("URL列表不能为空");
    }
    for url in urls {
        if !is_valid_url(url) {
            anyhow::bail!("无效的URL: {}", url);
        }
    }
    Ok(())
}
