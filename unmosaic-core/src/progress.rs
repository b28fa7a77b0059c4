use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;

static BARS: Lazy<MultiProgress> = Lazy::new(MultiProgress::new);

const DOWNLOAD_TEMPLATE: &str =
    "{msg} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})";
const BATCH_TEMPLATE: &str = "{msg} [{elapsed_precise}] [{wide_bar}] {pos}/{len} ({eta})";

fn styled(pb: ProgressBar, template: &str, message: String) -> ProgressBar {
    let pb = BARS.add(pb);
    pb.set_style(ProgressStyle::with_template(template).expect("valid progress template"));
    pb.set_message(message);
    pb
}

/// Byte counter for a model download. Unknown sizes render as a bar that
/// never fills.
pub fn download_bar(filename: &str, total: Option<u64>) -> ProgressBar {
    let pb = match total {
        Some(total) => ProgressBar::new(total),
        None => ProgressBar::no_length(),
    };
    styled(pb, DOWNLOAD_TEMPLATE, filename.to_string())
}

/// Bar counting images rather than bytes, used by batch runs.
pub fn batch_bar(total: usize) -> ProgressBar {
    styled(
        ProgressBar::new(total as u64),
        BATCH_TEMPLATE,
        "Uncensoring images".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bars_carry_their_length() {
        assert_eq!(download_bar("lama.onnx", Some(1024)).length(), Some(1024));
        assert_eq!(download_bar("lama.onnx", None).length(), None);
        assert_eq!(batch_bar(7).length(), Some(7));
    }
}
