//! Parameter update rules applied to accumulated gradients.

mod gradient_descent;
mod update_method;

pub use gradient_descent::GradientDescent;
pub use update_method::UpdateMethod;
