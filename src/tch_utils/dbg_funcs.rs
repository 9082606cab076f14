use tch::{Kind, Tensor};

/// One line summary of a tensor for debug logging, values are not printed.
pub fn tensor_summary(ten_name: &str, ten: &Tensor) -> String {
    let stats = if ten.numel() > 0 && ten.is_floating_point() {
        let flat = ten.detach().to_kind(Kind::Float);
        format!(
            ", mean: {:.4}, min: {:.4}, max: {:.4}",
            flat.mean(Kind::Float).double_value(&[]),
            flat.min().double_value(&[]),
            flat.max().double_value(&[]),
        )
    } else {
        String::new()
    };
    format!("Tensor {ten_name} {{ size: {:?}, device: {:?}{stats} }}", ten.size(), ten.device())
}
