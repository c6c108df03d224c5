async fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("rmir_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

pub async fn setup_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    create_temp_dir().await
}

/// Deterministic non-repeating payload so identical sizes with different
/// offsets never hash alike by accident.
pub fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let x = i as u64;
            (x.wrapping_mul(2654435761).wrapping_add(x >> 8) & 0xff) as u8
        })
        .collect()
}

/// Builds the standard source tree used by the mirror tests:
///
/// ```text
/// src
/// |- 0.txt
/// |- bar
/// |  |- 1.txt
/// |  |- 2.bin        (large enough for the pipelined path)
/// |- baz
///    |- 3.txt
///    |- 4.txt -> ../bar/1.txt
/// ```
pub async fn setup_source_tree(tmp_dir: &std::path::Path) -> anyhow::Result<std::path::PathBuf> {
    let src = tmp_dir.join("src");
    tokio::fs::create_dir(&src).await?;
    tokio::fs::write(src.join("0.txt"), "0").await?;
    let bar = src.join("bar");
    tokio::fs::create_dir(&bar).await?;
    tokio::fs::write(bar.join("1.txt"), "1").await?;
    tokio::fs::write(bar.join("2.bin"), patterned_bytes(256 * 1024)).await?;
    let baz = src.join("baz");
    tokio::fs::create_dir(&baz).await?;
    tokio::fs::write(baz.join("3.txt"), "3").await?;
    tokio::fs::symlink("../bar/1.txt", baz.join("4.txt")).await?;
    Ok(src)
}
