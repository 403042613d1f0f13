pub mod mask;
pub mod matrix;
pub mod seed;
pub mod seqtype;
pub mod sys;
