use candle_core::{DType, Device, Module, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use candle_norm::{LayerNorm, LayerNormConfig, RMSNorm, RMSNormConfig};

#[test]
fn layer_norm_backpropagates_to_parameters_and_input() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let ln = LayerNorm::new(8, LayerNormConfig::default(), vb)?;

    let x = Var::from_tensor(&Tensor::randn(0f32, 1.0, (4, 8), &device)?)?;
    let y = ln.forward(x.as_tensor())?;
    let loss = y.sqr()?.sum_all()?;
    let grads = loss.backward()?;

    for var in varmap.all_vars() {
        let grad = grads.get(&var);
        assert!(grad.is_some(), "missing gradient for a layer parameter");
        let grad = grad.unwrap();
        assert_eq!(grad.dims(), var.as_tensor().dims());
    }
    assert!(grads.get(&x).is_some(), "missing gradient for the input");
    Ok(())
}

#[test]
fn rms_norm_scale_gradient_is_finite() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let rms = RMSNorm::new(6, RMSNormConfig::default(), vb)?;

    let x = Tensor::randn(0f32, 1.0, (3, 6), &device)?;
    let loss = rms.forward(&x)?.sqr()?.sum_all()?;
    let grads = loss.backward()?;

    let vars = varmap.all_vars();
    assert_eq!(vars.len(), 1);
    let grad = grads.get(&vars[0]).expect("missing scale gradient");
    for g in grad.flatten_all()?.to_vec1::<f32>()? {
        assert!(g.is_finite(), "non-finite gradient {g}");
    }
    Ok(())
}
